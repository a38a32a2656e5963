// Screen Proctor operator CLI
// Drives a running coordinator through its control API and inspects the relay

use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use std::path::PathBuf;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use screen_proctor::roster::BackendClient;
use screen_proctor::signaling::SignalingMessage;

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Screen Proctor operator tool", long_about = None)]
struct Cli {
    /// Coordinator control API address
    #[arg(short, long, default_value = "127.0.0.1:8090")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check coordinator health endpoint
    Health,

    /// Show room, connections and recordings
    Status,

    /// Show the chat log, or send a message when TEXT is given
    Chat { text: Option<String> },

    /// Control recordings
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Download the recording archive
    Export {
        /// Directory to write the archive into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Stop all recordings and close every connection
    CloseRoom,

    /// Fetch a coordinator's roster from the backend
    Roster {
        #[arg(short, long)]
        backend: String,

        #[arg(short, long)]
        coordinator: String,
    },

    /// Issue a managed-routing session token from the backend
    Token {
        #[arg(short, long)]
        backend: String,

        #[arg(short, long)]
        coordinator: String,

        /// Comma-separated participant identities
        #[arg(short, long)]
        roster: String,
    },

    /// Print signaling traffic seen on a relay
    Watch {
        #[arg(short, long, default_value = "ws://127.0.0.1:3000/ws")]
        relay: String,

        /// Stop after this many seconds without traffic
        #[arg(short, long, default_value = "60")]
        idle_secs: u64,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    Start {
        /// Only this participant; all attached streams otherwise
        #[arg(short, long)]
        identity: Option<String>,
    },
    Stop {
        #[arg(short, long)]
        identity: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match &cli.command {
        Commands::Health => check_health(&client, &cli.server).await,
        Commands::Status => show_status(&client, &cli.server).await,
        Commands::Chat { text } => chat(&client, &cli.server, text.as_deref()).await,
        Commands::Record { action } => record(&client, &cli.server, action).await,
        Commands::Export { output } => export(&client, &cli.server, output).await,
        Commands::CloseRoom => {
            post_and_report(&client, &api_url(&cli.server, "room/close"), "Room closed").await
        }
        Commands::Roster {
            backend,
            coordinator,
        } => roster(backend, coordinator).await,
        Commands::Token {
            backend,
            coordinator,
            roster,
        } => token(backend, coordinator, roster).await,
        Commands::Watch { relay, idle_secs } => watch(relay, *idle_secs).await,
    }
}

fn api_url(server: &str, path: &str) -> String {
    format!("http://{}/proctor/{}", server, path)
}

async fn check_health(client: &reqwest::Client, server: &str) {
    println!("{}", "Checking coordinator health...".cyan());

    match client.get(api_url(server, "health")).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to coordinator: {}", "✗".red(), e);
            println!("  Make sure the coordinator is running on {}", server);
        }
    }
}

async fn show_status(client: &reqwest::Client, server: &str) {
    let body = match client.get(api_url(server, "status")).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
            Ok(body) => body,
            Err(e) => {
                println!("{} Invalid status response: {}", "✗".red(), e);
                return;
            }
        },
        Ok(resp) => {
            println!("{} Status request failed: {}", "✗".red(), resp.status());
            return;
        }
        Err(e) => {
            println!("{} Cannot connect to coordinator: {}", "✗".red(), e);
            return;
        }
    };

    println!("{} {}", "Coordinator:".bold(), body["identity"].as_str().unwrap_or("?"));
    let relay = if body["transport_connected"].as_bool().unwrap_or(false) {
        "connected".green()
    } else {
        "disconnected".red()
    };
    println!("{} {}", "Relay:".bold(), relay);

    match body["room"].as_object() {
        Some(room) => {
            println!("{} {}", "Room:".bold(), room["name"].as_str().unwrap_or("?").green().bold());
            let allowed = room["allowed"].as_array().map(|a| a.len()).unwrap_or(0);
            let joined = room["joined"].as_array().map(|a| a.len()).unwrap_or(0);
            println!("  Joined {}/{}", joined, allowed);
        }
        None => println!("{} {}", "Room:".bold(), "none".yellow()),
    }

    println!("\n{}", "Connections".bold());
    println!("{}", "═".repeat(60));
    for conn in body["connections"].as_array().into_iter().flatten() {
        let phase = conn["phase"].as_str().unwrap_or("?");
        let phase = if phase == "connected" { phase.green() } else { phase.yellow() };
        println!(
            "  {:<20} {:<12} {:<20} stream={} pending={}",
            conn["identity"].as_str().unwrap_or("?"),
            conn["registration_id"].as_str().unwrap_or("-"),
            phase,
            conn["has_stream"].as_bool().unwrap_or(false),
            conn["pending_candidates"].as_u64().unwrap_or(0)
        );
    }

    println!("\n{}", "Recordings".bold());
    println!("{}", "═".repeat(60));
    for rec in body["recordings"].as_array().into_iter().flatten() {
        println!(
            "  {:<20} {:<12} {:<24} {} chunks, {} bytes",
            rec["identity"].as_str().unwrap_or("?"),
            rec["label"].as_str().unwrap_or("?"),
            rec["state"].to_string(),
            rec["chunks"].as_u64().unwrap_or(0),
            rec["bytes"].as_u64().unwrap_or(0)
        );
    }
}

async fn chat(client: &reqwest::Client, server: &str, text: Option<&str>) {
    if let Some(text) = text {
        let result = client
            .post(api_url(server, "chat"))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await;
        report(result, "Message sent").await;
        return;
    }

    match client.get(api_url(server, "chat")).send().await {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(body) => {
                for entry in body.as_array().into_iter().flatten() {
                    println!(
                        "{} {}: {}",
                        entry["received_at"].as_str().unwrap_or("").dimmed(),
                        entry["sender"].as_str().unwrap_or("?").cyan(),
                        entry["text"].as_str().unwrap_or("")
                    );
                }
            }
            Err(e) => println!("{} Invalid chat response: {}", "✗".red(), e),
        },
        Err(e) => println!("{} Cannot connect to coordinator: {}", "✗".red(), e),
    }
}

async fn record(client: &reqwest::Client, server: &str, action: &RecordAction) {
    let (identity, verb) = match action {
        RecordAction::Start { identity } => (identity, "start"),
        RecordAction::Stop { identity } => (identity, "stop"),
    };

    let url = match identity {
        Some(identity) => api_url(
            server,
            &format!("recordings/{}/{}", urlencoding::encode(identity), verb),
        ),
        None => api_url(server, &format!("recordings/{}", verb)),
    };

    let result = client.post(&url).send().await;
    match result {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
            if identity.is_some() {
                println!("{} Recording {}", "✓".green(), verb);
                return;
            }
            for id in body["succeeded"].as_array().into_iter().flatten() {
                println!("{} {}", "✓".green(), id.as_str().unwrap_or("?"));
            }
            for failure in body["failed"].as_array().into_iter().flatten() {
                println!(
                    "{} {}: {}",
                    "✗".red(),
                    failure[0].as_str().unwrap_or("?"),
                    failure[1].as_str().unwrap_or("")
                );
            }
        }
        other => report(other, "").await,
    }
}

async fn export(client: &reqwest::Client, server: &str, output: &PathBuf) {
    println!("{}", "Requesting archive...".cyan());

    let resp = match client.post(api_url(server, "export")).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        other => {
            report(other, "").await;
            return;
        }
    };

    let file_name = resp
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split("filename=").nth(1))
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_else(|| "exam-recordings.zip".to_string());

    let bytes = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("{} Download failed: {}", "✗".red(), e);
            return;
        }
    };

    if let Err(e) = std::fs::create_dir_all(output) {
        println!("{} Cannot create {}: {}", "✗".red(), output.display(), e);
        return;
    }
    let path = output.join(file_name);
    match std::fs::write(&path, &bytes) {
        Ok(()) => println!(
            "{} Archive saved to {} ({} bytes)",
            "✓".green(),
            path.display().to_string().bold(),
            bytes.len()
        ),
        Err(e) => println!("{} Cannot write {}: {}", "✗".red(), path.display(), e),
    }
}

async fn roster(backend: &str, coordinator: &str) {
    let client = match BackendClient::new(backend) {
        Ok(client) => client,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };

    match client.fetch_roster(coordinator).await {
        Ok(roster) => {
            println!("{} {} participants", "✓".green(), roster.len());
            for identity in roster {
                println!("  {}", identity);
            }
        }
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

async fn token(backend: &str, coordinator: &str, roster: &str) {
    let client = match BackendClient::new(backend) {
        Ok(client) => client,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };

    let roster = screen_proctor::config::parse_list(roster);
    match client.issue_session_token(coordinator, &roster).await {
        Ok(token) => println!("{}", token.green()),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

async fn watch(relay: &str, idle_secs: u64) {
    println!("{} {}", "Watching relay".cyan(), relay);

    let (ws_stream, _) = match connect_async(relay).await {
        Ok(connected) => connected,
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
            return;
        }
    };
    let (_write, mut read) = ws_stream.split();

    loop {
        match timeout(Duration::from_secs(idle_secs), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<SignalingMessage>(&text) {
                Ok(message) => {
                    let route = message.routing_key().unwrap_or("room");
                    println!("{} {:<18} {}", "◀".green(), message.kind().bold(), route);
                }
                Err(_) => println!("{} {}", "?".yellow(), text.bright_white()),
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                println!("{} Relay closed the connection", "✗".yellow());
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                println!("{} Connection error: {}", "✗".red(), e);
                break;
            }
            Err(_) => {
                println!("{} No traffic for {}s", "⏱".yellow(), idle_secs);
                break;
            }
        }
    }
}

async fn post_and_report(client: &reqwest::Client, url: &str, success: &str) {
    let result = client.post(url).send().await;
    report(result, success).await;
}

async fn report(result: reqwest::Result<reqwest::Response>, success: &str) {
    match result {
        Ok(resp) if resp.status().is_success() => {
            println!("{} {}", "✓".green(), success);
        }
        Ok(resp) => {
            let status = resp.status();
            let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
            println!(
                "{} {}: {}",
                "✗".red(),
                status,
                body["error"].as_str().unwrap_or("request failed")
            );
        }
        Err(e) => println!("{} Cannot connect to coordinator: {}", "✗".red(), e),
    }
}
