use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Recording,
    Stopping,
    Stopped,
    Failed(String),
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingState {
    /// Capture task still owns the session.
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Stopping)
    }
}

/// Capture record for one participant stream.
#[derive(Debug)]
pub struct RecordingSession {
    identity: String,
    label: String,
    state: RecordingState,
    chunks: Vec<Vec<u8>>,
    output: Option<Vec<u8>>,
}

impl RecordingSession {
    pub fn new(identity: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            label: label.into(),
            state: RecordingState::Idle,
            chunks: Vec::new(),
            output: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Export name stem: registration id when known, identity otherwise.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> &RecordingState {
        &self.state
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    pub fn begin(&mut self) {
        self.state = RecordingState::Recording;
    }

    pub fn begin_stop(&mut self) {
        if self.state == RecordingState::Recording {
            self.state = RecordingState::Stopping;
        }
    }

    /// Appends a chunk while capture is running. Empty chunks are dropped.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() || !self.state.is_active() {
            return;
        }
        self.chunks.push(chunk);
    }

    /// Joins the chunk sequence into the output blob and marks the session
    /// stopped. A failed session keeps its failure.
    pub fn finalize(&mut self) {
        if let RecordingState::Failed(_) = self.state {
            return;
        }
        self.output = Some(self.chunks.concat());
        self.state = RecordingState::Stopped;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(identity = %self.identity, reason = %reason, "Recording failed");
        self.state = RecordingState::Failed(reason);
        self.output = None;
    }

    /// Stopped with captured data.
    pub fn is_exportable(&self) -> bool {
        self.state == RecordingState::Stopped
            && self.output.as_ref().is_some_and(|output| !output.is_empty())
    }

    pub fn snapshot(&self) -> RecordingSnapshot {
        RecordingSnapshot {
            identity: self.identity.clone(),
            label: self.label.clone(),
            state: self.state.clone(),
            chunks: self.chunks.len(),
            bytes: self.chunks.iter().map(Vec::len).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSnapshot {
    pub identity: String,
    pub label: String,
    pub state: RecordingState,
    pub chunks: usize,
    pub bytes: usize,
}
