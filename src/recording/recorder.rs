use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::capture::{spawn_capture, CaptureHandle};
use super::pipeline::EncoderFactory;
use super::quality::QualityTier;
use super::state::{RecordingSession, RecordingSnapshot, RecordingState};
use crate::config::RecordingConfig;
use crate::error::{ProctorError, Result};
use crate::session::ConnectionRegistry;

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub chunk_interval: Duration,
    /// Upper bound on waiting for a pipeline to flush after stop
    pub flush_timeout: Duration,
    pub tier: QualityTier,
}

impl CaptureSettings {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            chunk_interval: config.chunk_interval,
            flush_timeout: config.flush_timeout,
            tier: QualityTier::for_target(config.target_bitrate),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from_config(&RecordingConfig::default())
    }
}

/// Per-identity result of a bulk start/stop.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Owns one Recording Session per recorded identity.
///
/// Streams are looked up in the connection registry at start time; after
/// that the capture only holds the stream, so closing the entry does not
/// tear the recording down.
pub struct RecordingManager {
    registry: Arc<ConnectionRegistry>,
    encoders: Arc<dyn EncoderFactory>,
    settings: CaptureSettings,
    sessions: RwLock<HashMap<String, Arc<Mutex<RecordingSession>>>>,
    captures: Mutex<HashMap<String, CaptureHandle>>,
}

impl RecordingManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        encoders: Arc<dyn EncoderFactory>,
        settings: CaptureSettings,
    ) -> Self {
        tracing::info!(
            tier = %settings.tier,
            bitrate_bps = settings.tier.bitrate_bps(),
            chunk_interval_ms = settings.chunk_interval.as_millis() as u64,
            "Recording manager ready"
        );

        Self {
            registry,
            encoders,
            settings,
            sessions: RwLock::new(HashMap::new()),
            captures: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn container_extension(&self) -> &'static str {
        self.encoders.container_extension()
    }

    /// Start recording the identity's attached stream. No-op if already recording.
    pub async fn start(&self, identity: &str) -> Result<()> {
        let mut captures = self.captures.lock().await;

        if let Some(existing) = self.sessions.read().await.get(identity) {
            if existing.lock().await.state().is_active() {
                tracing::debug!(identity = %identity, "Already recording");
                return Ok(());
            }
        }

        let (stream, label) = self
            .registry
            .attached_stream(identity)
            .await
            .ok_or_else(|| ProctorError::recording(identity, "no attached stream"))?;

        let encoder = self
            .encoders
            .create(identity, self.settings.tier.bitrate_bps())?;

        let mut session = RecordingSession::new(identity, label);
        session.begin();
        let session = Arc::new(Mutex::new(session));

        self.sessions
            .write()
            .await
            .insert(identity.to_string(), session.clone());

        let handle = spawn_capture(session, stream, encoder, self.settings.chunk_interval);
        captures.insert(identity.to_string(), handle);

        tracing::info!(identity = %identity, tier = %self.settings.tier, "Started recording");
        Ok(())
    }

    /// Start every identity with an attached stream. One failure does not
    /// prevent the others.
    pub async fn start_all(&self) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();

        for (identity, _, _) in self.registry.attached_streams().await {
            match self.start(&identity).await {
                Ok(()) => outcome.succeeded.push(identity),
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "Failed to start recording");
                    outcome.failed.push((identity, e.to_string()));
                }
            }
        }

        tracing::info!(
            started = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Bulk recording start"
        );
        outcome
    }

    /// Stop one recording and wait for its pipeline to flush.
    pub async fn stop(&self, identity: &str) -> Result<RecordingState> {
        let handle = self.captures.lock().await.remove(identity);

        match handle {
            Some(handle) => Ok(self.finish_capture(identity, handle).await),
            None => match self.sessions.read().await.get(identity) {
                Some(session) => Ok(session.lock().await.state().clone()),
                None => Err(ProctorError::recording(identity, "not recording")),
            },
        }
    }

    /// Stop every running capture concurrently and wait for all of them to
    /// flush before returning.
    pub async fn stop_all(&self) -> BulkOutcome {
        let handles: Vec<(String, CaptureHandle)> = self.captures.lock().await.drain().collect();

        let results = join_all(handles.into_iter().map(|(identity, handle)| async move {
            let state = self.finish_capture(&identity, handle).await;
            (identity, state)
        }))
        .await;

        let mut outcome = BulkOutcome::default();
        for (identity, state) in results {
            match state {
                RecordingState::Stopped => outcome.succeeded.push(identity),
                RecordingState::Failed(reason) => outcome.failed.push((identity, reason)),
                other => outcome.failed.push((identity, format!("{:?}", other))),
            }
        }

        tracing::info!(
            stopped = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "All recordings stopped"
        );
        outcome
    }

    async fn finish_capture(&self, identity: &str, handle: CaptureHandle) -> RecordingState {
        let Some(session) = self.sessions.read().await.get(identity).cloned() else {
            handle.task.abort();
            return RecordingState::Failed("session missing".to_string());
        };

        session.lock().await.begin_stop();

        let CaptureHandle { stop, mut task } = handle;
        let _ = stop.send(());

        match tokio::time::timeout(self.settings.flush_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.lock().await.fail(format!("capture task failed: {}", e));
            }
            Err(_) => {
                tracing::warn!(
                    identity = %identity,
                    timeout_ms = self.settings.flush_timeout.as_millis() as u64,
                    "Flush timed out, keeping chunks captured so far"
                );
                task.abort();
                session.lock().await.finalize();
            }
        }

        let state = session.lock().await.state().clone();
        tracing::info!(identity = %identity, state = ?state, "Recording stopped");
        state
    }

    pub async fn is_recording(&self, identity: &str) -> bool {
        self.captures.lock().await.contains_key(identity)
    }

    pub async fn state(&self, identity: &str) -> Option<RecordingState> {
        let session = self.sessions.read().await.get(identity).cloned()?;
        let state = session.lock().await.state().clone();
        Some(state)
    }

    pub async fn snapshots(&self) -> Vec<RecordingSnapshot> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    /// Locks every session for reading by the exporter.
    pub async fn lock_sessions(&self) -> Vec<OwnedMutexGuard<RecordingSession>> {
        let mut sessions: Vec<(String, Arc<Mutex<RecordingSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));

        let mut guards = Vec::with_capacity(sessions.len());
        for (_, session) in sessions {
            guards.push(session.lock_owned().await);
        }
        guards
    }
}
