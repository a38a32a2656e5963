use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use crate::error::{ProctorError, Result};

/// Inbound media as a sequence of raw RTP packets.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;

    /// Next marshalled RTP packet; `Ok(None)` once the sender has gone away.
    async fn read_packet(&self) -> Result<Option<Vec<u8>>>;
}

/// The stream attached to a Connection Entry once media starts flowing.
#[derive(Clone)]
pub struct InboundStream {
    pub id: String,
    pub track: Arc<dyn MediaTrack>,
}

impl InboundStream {
    pub fn new(track: Arc<dyn MediaTrack>) -> Self {
        Self {
            id: track.id(),
            track,
        }
    }
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream").field("id", &self.id).finish()
    }
}

/// webrtc-rs remote track.
pub struct RtpTrack {
    track: Arc<TrackRemote>,
}

impl RtpTrack {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl MediaTrack for RtpTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    async fn read_packet(&self) -> Result<Option<Vec<u8>>> {
        match self.track.read_rtp().await {
            Ok((packet, _attributes)) => {
                let bytes = packet
                    .marshal()
                    .map_err(|e| ProctorError::WebRtcApi(format!("Failed to marshal RTP: {}", e)))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(e) => {
                tracing::debug!(track_id = %self.track.id(), error = %e, "Remote track ended");
                Ok(None)
            }
        }
    }
}
