pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod logging;
pub mod participant;
pub mod recording;
pub mod roster;
pub mod session;
pub mod signaling;

pub use coordinator::Coordinator;
pub use error::{ProctorError, Result};
pub use participant::Participant;
