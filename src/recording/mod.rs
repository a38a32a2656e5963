mod capture;
mod pipeline;
mod quality;
mod recorder;
mod state;

pub use pipeline::{ChunkEncoder, EncoderFactory, GstChunkEncoder, GstEncoderFactory};
pub use quality::QualityTier;
pub use recorder::{BulkOutcome, CaptureSettings, RecordingManager};
pub use state::{RecordingSession, RecordingSnapshot, RecordingState};
