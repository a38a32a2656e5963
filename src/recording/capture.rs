use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::pipeline::ChunkEncoder;
use super::state::RecordingSession;
use crate::session::InboundStream;

const PACKET_QUEUE: usize = 512;

/// Running capture for one stream.
pub(super) struct CaptureHandle {
    pub stop: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

enum CaptureEnd {
    StopRequested,
    StreamEnded,
    EncoderFailed(String),
}

/// Reads the stream into `encoder`, appends one chunk to `session` every
/// `chunk_interval` and flushes the encoder tail once stopped.
pub(super) fn spawn_capture(
    session: Arc<Mutex<RecordingSession>>,
    stream: InboundStream,
    mut encoder: Box<dyn ChunkEncoder>,
    chunk_interval: Duration,
) -> CaptureHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let identity = session.lock().await.identity().to_string();
        let (packet_tx, mut packet_rx) = mpsc::channel::<Vec<u8>>(PACKET_QUEUE);

        let track = stream.track.clone();
        let reader_identity = identity.clone();
        let reader = tokio::spawn(async move {
            loop {
                match track.read_packet().await {
                    Ok(Some(packet)) => {
                        if packet_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(identity = %reader_identity, error = %e, "Stream read failed");
                        break;
                    }
                }
            }
        });

        let mut ticker = tokio::time::interval(chunk_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tracing::info!(identity = %identity, stream_id = %stream.id, "Capture started");

        let end = loop {
            tokio::select! {
                biased;

                _ = &mut stop_rx => break CaptureEnd::StopRequested,

                _ = ticker.tick() => match encoder.pull_chunk() {
                    Ok(Some(chunk)) => {
                        tracing::trace!(identity = %identity, bytes = chunk.len(), "Chunk captured");
                        session.lock().await.push_chunk(chunk);
                    }
                    Ok(None) => {}
                    Err(e) => break CaptureEnd::EncoderFailed(e.to_string()),
                },

                packet = packet_rx.recv() => match packet {
                    Some(packet) => {
                        if let Err(e) = encoder.push_rtp(&packet) {
                            break CaptureEnd::EncoderFailed(e.to_string());
                        }
                    }
                    None => break CaptureEnd::StreamEnded,
                },
            }
        };

        reader.abort();

        // Packets already read before the stop belong to the recording
        if let CaptureEnd::StopRequested = end {
            while let Ok(packet) = packet_rx.try_recv() {
                if let Err(e) = encoder.push_rtp(&packet) {
                    tracing::warn!(identity = %identity, error = %e, "Dropping packet during flush");
                    break;
                }
            }
        }

        let flushed = tokio::task::spawn_blocking(move || encoder.finish()).await;

        let mut session = session.lock().await;
        match end {
            CaptureEnd::StopRequested => match flushed {
                Ok(Ok(tail)) => {
                    session.push_chunk(tail);
                    session.finalize();
                    tracing::info!(
                        identity = %identity,
                        chunks = session.chunk_count(),
                        "Capture stopped and flushed"
                    );
                }
                Ok(Err(e)) => session.fail(format!("flush failed: {}", e)),
                Err(e) => session.fail(format!("flush task failed: {}", e)),
            },
            CaptureEnd::StreamEnded => session.fail("stream ended while recording"),
            CaptureEnd::EncoderFailed(reason) => session.fail(reason),
        }
    });

    CaptureHandle {
        stop: stop_tx,
        task,
    }
}
