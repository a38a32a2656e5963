use thiserror::Error;

/// Error taxonomy for the coordinator and participant roles.
///
/// Per-entry and per-stream failures (`Negotiation`, `MediaAcquisition`,
/// `Recording`) are isolated to the identity that produced them. Only
/// `Export` aborts the whole operation.
#[derive(Debug, Error)]
pub enum ProctorError {
    /// Relay unreachable or disconnected
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// Malformed or out-of-phase offer/answer/candidate
    #[error("Negotiation failed for {identity}: {reason}")]
    Negotiation { identity: String, reason: String },

    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Recording failed for {identity}: {reason}")]
    Recording { identity: String, reason: String },

    #[error("Archive export failed: {0}")]
    Export(String),

    /// Room errors
    #[error("No room is open")]
    NoRoom,

    #[error("Identity {0} is not on the room allow-list")]
    NotAllowed(String),

    /// Configuration errors
    #[error("Missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigurationParseFailed(String),

    /// REST collaborators
    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    pub fn transport(msg: impl Into<String>) -> Self {
        ProctorError::Transport(msg.into())
    }

    pub fn negotiation(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        ProctorError::Negotiation {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    pub fn recording(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        ProctorError::Recording {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    pub fn export(msg: impl Into<String>) -> Self {
        ProctorError::Export(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    /// Whether the failure aborts the surrounding operation as a whole.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProctorError::Export(_))
    }
}

impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::WebRtcApi(err.to_string())
    }
}

impl From<zip::result::ZipError> for ProctorError {
    fn from(err: zip::result::ZipError) -> Self {
        ProctorError::Export(err.to_string())
    }
}

impl From<reqwest::Error> for ProctorError {
    fn from(err: reqwest::Error) -> Self {
        ProctorError::Backend(err.to_string())
    }
}
