use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::time::{Duration, Instant};

use crate::error::{ProctorError, Result};

const FLUSH_POLL: Duration = Duration::from_millis(100);

/// One poll of a draining sink.
#[derive(Debug)]
enum SinkPoll {
    Data(Vec<u8>),
    Pending,
    Eos,
}

/// Collects sink output until EOS. Pulling is what lets the sink's EOS
/// through; a sink waiting on EOS holds it until its queue is consumed.
/// Gives up with what it has once `deadline` passes.
fn collect_until_eos<F>(mut poll: F, deadline: Duration) -> Result<(Vec<u8>, bool)>
where
    F: FnMut() -> Result<SinkPoll>,
{
    let started = Instant::now();
    let mut tail = Vec::new();

    loop {
        match poll()? {
            SinkPoll::Data(bytes) => tail.extend_from_slice(&bytes),
            SinkPoll::Eos => return Ok((tail, true)),
            SinkPoll::Pending if started.elapsed() >= deadline => return Ok((tail, false)),
            SinkPoll::Pending => {}
        }
    }
}

/// Turns inbound RTP into time-sliced container chunks.
///
/// Chunks pulled in order and concatenated with the `finish` tail form one
/// playable file.
pub trait ChunkEncoder: Send {
    fn push_rtp(&mut self, packet: &[u8]) -> Result<()>;

    /// Bytes produced since the previous pull; `None` if nothing new.
    fn pull_chunk(&mut self) -> Result<Option<Vec<u8>>>;

    /// Flush everything still buffered. Blocks.
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self, identity: &str, bitrate_bps: u32) -> Result<Box<dyn ChunkEncoder>>;

    fn container_extension(&self) -> &'static str {
        "webm"
    }
}

pub struct GstEncoderFactory {
    flush_deadline: Duration,
}

impl GstEncoderFactory {
    /// Encoders give up on the muxer tail a little before the recorder
    /// stops waiting for them.
    pub fn new(flush_timeout: Duration) -> Self {
        Self {
            flush_deadline: flush_timeout.mul_f32(0.8),
        }
    }
}

impl EncoderFactory for GstEncoderFactory {
    fn create(&self, identity: &str, bitrate_bps: u32) -> Result<Box<dyn ChunkEncoder>> {
        Ok(Box::new(GstChunkEncoder::new(
            identity,
            bitrate_bps,
            self.flush_deadline,
        )?))
    }
}

pub struct GstChunkEncoder {
    identity: String,
    flush_deadline: Duration,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
}

impl GstChunkEncoder {
    pub fn new(identity: &str, bitrate_bps: u32, flush_deadline: Duration) -> Result<Self> {
        let fail = |reason: String| ProctorError::recording(identity, reason);

        gst::init().map_err(|e| fail(format!("GStreamer init failed: {}", e)))?;

        let pipeline = gst::Pipeline::new();

        // appsrc -> rtpvp8depay -> vp8dec -> videoconvert -> vp8enc -> webmmux -> appsink
        let appsrc = gst::ElementFactory::make("appsrc")
            .name("screen_src")
            .build()
            .map_err(|e| fail(format!("Failed to create appsrc: {}", e)))?
            .dynamic_cast::<gst_app::AppSrc>()
            .map_err(|_| fail("Failed to cast to AppSrc".into()))?;

        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(true);
        appsrc.set_do_timestamp(true);

        let caps = gst::Caps::builder("application/x-rtp")
            .field("media", "video")
            .field("encoding-name", "VP8")
            .field("clock-rate", 90000i32)
            .field("payload", 96i32)
            .build();
        appsrc.set_caps(Some(&caps));

        let rtpvp8depay = gst::ElementFactory::make("rtpvp8depay")
            .build()
            .map_err(|e| fail(format!("Failed to create rtpvp8depay: {}", e)))?;

        let vp8dec = gst::ElementFactory::make("vp8dec")
            .build()
            .map_err(|e| fail(format!("Failed to create vp8dec: {}", e)))?;

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| fail(format!("Failed to create videoconvert: {}", e)))?;

        let vp8enc = gst::ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("cpu-used", 4i32)
            .property("target-bitrate", bitrate_bps.min(i32::MAX as u32) as i32)
            .build()
            .map_err(|e| fail(format!("Failed to create vp8enc: {}", e)))?;

        // Streamable output so chunks concatenate into a valid file
        let webmmux = gst::ElementFactory::make("webmmux")
            .property("streamable", true)
            .build()
            .map_err(|e| fail(format!("Failed to create webmmux: {}", e)))?;

        let appsink = gst::ElementFactory::make("appsink")
            .name("chunk_sink")
            .property("sync", false)
            .build()
            .map_err(|e| fail(format!("Failed to create appsink: {}", e)))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| fail("Failed to cast to AppSink".into()))?;

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &rtpvp8depay,
                &vp8dec,
                &videoconvert,
                &vp8enc,
                &webmmux,
                appsink.upcast_ref(),
            ])
            .map_err(|e| fail(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([
            appsrc.upcast_ref(),
            &rtpvp8depay,
            &vp8dec,
            &videoconvert,
            &vp8enc,
            &webmmux,
            appsink.upcast_ref(),
        ])
        .map_err(|e| fail(format!("Failed to link elements: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| fail(format!("Failed to start pipeline: {}", e)))?;

        tracing::info!(identity = %identity, bitrate_bps = bitrate_bps, "Created capture pipeline");

        Ok(Self {
            identity: identity.to_string(),
            flush_deadline,
            pipeline,
            appsrc,
            appsink,
        })
    }

    fn sample_bytes(&self, sample: &gst::Sample) -> Result<Vec<u8>> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| ProctorError::recording(&self.identity, "Sample without buffer"))?;
        let map = buffer.map_readable().map_err(|e| {
            ProctorError::recording(&self.identity, format!("Failed to map buffer: {}", e))
        })?;
        Ok(map.as_slice().to_vec())
    }

    fn drain_sink(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            bytes.extend_from_slice(&self.sample_bytes(&sample)?);
        }
        Ok(bytes)
    }

    fn poll_flush(&self, bus: &gst::Bus) -> Result<SinkPoll> {
        if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(ProctorError::recording(
                    &self.identity,
                    format!("Pipeline error during flush: {}", err.error()),
                ));
            }
        }

        let wait = gst::ClockTime::from_mseconds(FLUSH_POLL.as_millis() as u64);
        match self.appsink.try_pull_sample(wait) {
            Some(sample) => Ok(SinkPoll::Data(self.sample_bytes(&sample)?)),
            None if self.appsink.is_eos() => Ok(SinkPoll::Eos),
            None => Ok(SinkPoll::Pending),
        }
    }
}

impl ChunkEncoder for GstChunkEncoder {
    fn push_rtp(&mut self, packet: &[u8]) -> Result<()> {
        let buffer = gst::Buffer::from_slice(packet.to_vec());
        self.appsrc.push_buffer(buffer).map_err(|e| {
            ProctorError::recording(&self.identity, format!("Failed to push RTP: {}", e))
        })?;
        Ok(())
    }

    fn pull_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let bytes = self.drain_sink()?;
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        let _ = self.appsrc.end_of_stream();

        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| ProctorError::recording(&self.identity, "Pipeline without bus"))?;

        let flushed = collect_until_eos(|| self.poll_flush(&bus), self.flush_deadline);
        let stopped = self.pipeline.set_state(gst::State::Null);

        let (tail, reached_eos) = flushed?;
        stopped.map_err(|e| {
            ProctorError::recording(&self.identity, format!("Failed to stop pipeline: {}", e))
        })?;

        if !reached_eos {
            tracing::warn!(
                identity = %self.identity,
                deadline_ms = self.flush_deadline.as_millis() as u64,
                "EOS did not reach the sink, keeping partial tail"
            );
        }
        tracing::debug!(identity = %self.identity, tail_bytes = tail.len(), "Capture pipeline flushed");
        Ok(tail)
    }
}
