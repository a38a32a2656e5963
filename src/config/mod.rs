use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProctorError, Result};

pub struct Config {
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub backend: BackendConfig,
    pub recording: RecordingConfig,
    pub ice: IceConfig,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

pub struct SignalingConfig {
    pub url: String,
    pub coordinator_id: String,
    pub room_name: Option<String>,
}

pub struct BackendConfig {
    pub url: Option<String>,
    /// Used when no backend is configured
    pub roster: Vec<String>,
}

pub struct RecordingConfig {
    pub output_dir: String,
    pub chunk_interval: Duration,
    pub flush_timeout: Duration,
    pub target_bitrate: Option<u32>,
}

pub struct IceConfig {
    pub stun_servers: Vec<String>,
    /// Relay for participants behind symmetric NAT
    pub turn: Option<TurnServer>,
}

pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
        }
    }
}

impl IceConfig {
    fn from_env() -> Self {
        let stun_servers = env::var("STUN_SERVERS")
            .map(|list| parse_list(&list))
            .ok()
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(|| Self::default().stun_servers);

        let turn = match (
            env::var("TURN_SERVER_URL"),
            env::var("TURN_USERNAME"),
            env::var("TURN_CREDENTIAL"),
        ) {
            (Ok(url), Ok(username), Ok(credential)) => Some(TurnServer {
                url,
                username,
                credential,
            }),
            _ => None,
        };

        Self { stun_servers, turn }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: "./recordings".to_string(),
            chunk_interval: Duration::from_millis(1000),
            flush_timeout: Duration::from_millis(1000),
            target_bitrate: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = RecordingConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 8090)?,
            },
            signaling: SignalingConfig {
                url: env::var("SIGNALING_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:3000/ws".to_string()),
                coordinator_id: env::var("COORDINATOR_ID")
                    .map_err(|_| ProctorError::MissingConfiguration("COORDINATOR_ID".into()))?,
                room_name: env::var("ROOM_NAME").ok().filter(|s| !s.is_empty()),
            },
            backend: BackendConfig {
                url: env::var("BACKEND_URL").ok().filter(|s| !s.is_empty()),
                roster: env::var("ROSTER")
                    .map(|list| parse_list(&list))
                    .unwrap_or_default(),
            },
            recording: RecordingConfig {
                output_dir: env::var("RECORDING_OUTPUT_DIR").unwrap_or(defaults.output_dir),
                chunk_interval: Duration::from_millis(parse_var(
                    "RECORDING_CHUNK_INTERVAL_MS",
                    defaults.chunk_interval.as_millis() as u64,
                )?),
                flush_timeout: Duration::from_millis(parse_var(
                    "RECORDING_FLUSH_TIMEOUT_MS",
                    defaults.flush_timeout.as_millis() as u64,
                )?),
                target_bitrate: match env::var("RECORDING_TARGET_BITRATE") {
                    Ok(raw) => Some(parse_value("RECORDING_TARGET_BITRATE", &raw)?),
                    Err(_) => None,
                },
            },
            ice: IceConfig::from_env(),
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ProctorError::ConfigurationParseFailed(format!("{}={}", name, raw)))
}

/// Comma-separated list, blanks dropped.
pub fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
