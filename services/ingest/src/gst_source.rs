//! GStreamer backends: RTSP receive and H.264 decode.
//!
//! Receive and decode are separate pipelines. The receive pipeline stops at
//! the depayloader so that access units cross the connector boundary as
//! encoded bytes and decoding stays owned by the frame processor.

use crate::config::PixelFormat;
use crate::decoder::{DecodeError, DecoderFactory, FrameDecoder};
use crate::frame::{AccessUnit, DecodedImage};
use crate::rtsp_client::{MediaPacket, MediaSource, MediaStream, RtspError, StreamSession};
use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Access units buffered between the GStreamer streaming thread and the
/// connector. The streaming thread blocks when this is full.
const UNIT_CHANNEL_CAPACITY: usize = 8;

enum StreamEvent {
    Unit(MediaPacket),
    Eos,
    Error(RtspError),
}

/// Build the receive pipeline for a session.
fn build_pipeline_string(session: &StreamSession) -> String {
    format!(
        "rtspsrc location={url} protocols={transport} latency={latency} \
         ! rtph264depay ! h264parse config-interval=-1 \
         ! video/x-h264,stream-format=byte-stream,alignment=au \
         ! appsink name=sink emit-signals=false sync=false max-buffers={buffers}",
        url = session.url,
        transport = session.transport.as_str(),
        latency = session.buffer_ms,
        buffers = UNIT_CHANNEL_CAPACITY,
    )
}

/// Returns a pipeline to `Null` when dropped unless disarmed.
///
/// `open` can be abandoned at any await point, most often by the connector's
/// connect timeout, and a pipeline left in `Playing` keeps its sockets and
/// streaming threads alive.
struct NullOnDrop {
    pipeline: gst::Pipeline,
    armed: bool,
}

impl NullOnDrop {
    fn new(pipeline: gst::Pipeline) -> Self {
        Self {
            pipeline,
            armed: true,
        }
    }

    fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    fn disarm(mut self) -> gst::Pipeline {
        self.armed = false;
        self.pipeline.clone()
    }
}

impl Drop for NullOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

/// RTSP receiver backed by `rtspsrc`.
pub struct GstRtspSource {
    device_id: String,
}

impl GstRtspSource {
    pub fn new(device_id: impl Into<String>) -> Result<Self, RtspError> {
        gst::init().map_err(|e| RtspError::GstreamerInit(e.to_string()))?;
        Ok(Self {
            device_id: device_id.into(),
        })
    }

    fn create_pipeline(
        &self,
        session: &StreamSession,
        sender: mpsc::Sender<StreamEvent>,
    ) -> Result<gst::Pipeline, RtspError> {
        let pipeline_str = build_pipeline_string(session);
        debug!(pipeline = %pipeline_str, session_id = session.id, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| RtspError::PipelineCreation(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| RtspError::PipelineCreation("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| RtspError::ElementNotFound("appsink".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| RtspError::ElementNotFound("Could not cast to AppSink".to_string()))?;

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let packet = MediaPacket {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        pts: buffer.pts().map(|t| t.nseconds()),
                    };

                    // Runs on a GStreamer streaming thread, never on the runtime.
                    match sender.blocking_send(StreamEvent::Unit(packet)) {
                        Ok(()) => Ok(gst::FlowSuccess::Ok),
                        Err(_) => Err(gst::FlowError::Eos),
                    }
                })
                .build(),
        );

        Ok(pipeline)
    }
}

#[async_trait]
impl MediaSource for GstRtspSource {
    async fn open(&self, session: &StreamSession) -> Result<Box<dyn MediaStream>, RtspError> {
        let (tx, rx) = mpsc::channel(UNIT_CHANNEL_CAPACITY);
        let guard = NullOnDrop::new(self.create_pipeline(session, tx.clone())?);

        guard
            .pipeline()
            .set_state(gst::State::Playing)
            .map_err(|e| RtspError::ConnectionFailed(e.to_string()))?;

        let waiting = guard.pipeline().clone();
        let timeout = gst::ClockTime::from_mseconds(session.connection_timeout.as_millis() as u64);
        let (result, _state, _pending) =
            tokio::task::spawn_blocking(move || waiting.state(timeout))
                .await
                .map_err(|e| RtspError::ConnectionFailed(e.to_string()))?;

        if result.is_err() {
            return Err(RtspError::ConnectionFailed(
                "Timeout waiting for pipeline to start".to_string(),
            ));
        }

        info!(
            device_id = %self.device_id,
            session_id = session.id,
            "RTSP pipeline playing"
        );

        let running = Arc::new(AtomicBool::new(true));
        spawn_bus_watch(guard.pipeline(), tx, running.clone(), self.device_id.clone())?;

        let pipeline = guard.disarm();
        Ok(Box::new(GstRtspStream {
            pipeline,
            events: rx,
            running,
        }))
    }
}

/// Forward bus errors and end-of-stream into the session's event channel.
fn spawn_bus_watch(
    pipeline: &gst::Pipeline,
    sender: mpsc::Sender<StreamEvent>,
    running: Arc<AtomicBool>,
    device_id: String,
) -> Result<(), RtspError> {
    let bus = pipeline
        .bus()
        .ok_or_else(|| RtspError::ElementNotFound("bus".to_string()))?;

    std::thread::Builder::new()
        .name("gst-bus".to_string())
        .spawn(move || {
            while running.load(Ordering::SeqCst) {
                let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                    continue;
                };

                let event = match msg.view() {
                    gst::MessageView::Error(err) => {
                        error!(
                            device_id = %device_id,
                            error = %err.error(),
                            debug = ?err.debug(),
                            "GStreamer pipeline error"
                        );
                        StreamEvent::Error(RtspError::Transport(err.error().to_string()))
                    }
                    gst::MessageView::Eos(_) => {
                        info!(device_id = %device_id, "End of stream");
                        StreamEvent::Eos
                    }
                    gst::MessageView::Warning(w) => {
                        warn!(device_id = %device_id, warning = %w.error(), "GStreamer warning");
                        continue;
                    }
                    _ => continue,
                };

                let _ = sender.blocking_send(event);
                break;
            }
        })
        .map_err(|e| RtspError::PipelineCreation(e.to_string()))?;

    Ok(())
}

struct GstRtspStream {
    pipeline: gst::Pipeline,
    events: mpsc::Receiver<StreamEvent>,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl MediaStream for GstRtspStream {
    async fn next_unit(&mut self) -> Result<Option<MediaPacket>, RtspError> {
        match self.events.recv().await {
            Some(StreamEvent::Unit(packet)) => Ok(Some(packet)),
            Some(StreamEvent::Eos) | None => Ok(None),
            Some(StreamEvent::Error(e)) => Err(e),
        }
    }
}

impl Drop for GstRtspStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.events.close();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

const DECODE_PIPELINE: &str = "appsrc name=src is-live=true do-timestamp=true format=time \
     caps=video/x-h264,stream-format=byte-stream,alignment=au \
     ! h264parse ! avdec_h264 ! videoconvert \
     ! video/x-raw,format=RGB \
     ! appsink name=sink sync=false";

/// H.264 decoder built on `avdec_h264`.
pub struct GstH264Decoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
}

impl GstH264Decoder {
    fn new() -> Result<Self, DecodeError> {
        let pipeline = gst::parse::launch(DECODE_PIPELINE)
            .map_err(|e| DecodeError::Backend(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| DecodeError::Backend("Failed to cast to Pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| DecodeError::Backend("appsrc not found".to_string()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| DecodeError::Backend("appsink not found".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| DecodeError::Backend(e.to_string()))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
        })
    }

    fn check_bus(&self) -> Result<(), DecodeError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(DecodeError::Corrupt(err.error().to_string()));
            }
        }
        Ok(())
    }
}

/// Copy a decoded RGB sample into a tightly packed buffer.
fn sample_to_image(sample: &gst::Sample) -> Result<DecodedImage, DecodeError> {
    let caps = sample
        .caps()
        .ok_or_else(|| DecodeError::Backend("sample without caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| DecodeError::Backend(e.to_string()))?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| DecodeError::Backend("sample without buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|e| DecodeError::Backend(e.to_string()))?;

    let width = info.width();
    let height = info.height();
    let size = PixelFormat::Rgb24
        .frame_size(width, height)
        .ok_or_else(|| DecodeError::Corrupt(format!("{}x{} picture is too large", width, height)))?;
    let row = width as usize * PixelFormat::Rgb24.bytes_per_pixel();
    let stride = info.stride()[0] as usize;
    let src = map.as_slice();

    let mut data = Vec::with_capacity(size);
    for y in 0..height as usize {
        let start = y * stride;
        let line = src
            .get(start..start + row)
            .ok_or_else(|| DecodeError::Corrupt("short video buffer".to_string()))?;
        data.extend_from_slice(line);
    }

    Ok(DecodedImage {
        data,
        width,
        height,
        format: PixelFormat::Rgb24,
        pts: buffer.pts().map(|t| t.nseconds()),
    })
}

impl FrameDecoder for GstH264Decoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<DecodedImage>, DecodeError> {
        let buffer = gst::Buffer::from_slice(unit.data.clone());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| DecodeError::Backend(format!("push failed: {:?}", e)))?;
        self.check_bus()?;

        let mut images = Vec::new();
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            images.push(sample_to_image(&sample)?);
        }
        Ok(images)
    }

    fn reset(&mut self) -> Result<(), DecodeError> {
        let _ = self.pipeline.set_state(gst::State::Null);
        *self = GstH264Decoder::new()?;
        Ok(())
    }
}

impl Drop for GstH264Decoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

pub struct GstH264DecoderFactory;

impl GstH264DecoderFactory {
    pub fn new() -> Result<Self, DecodeError> {
        gst::init().map_err(|e| DecodeError::Backend(e.to_string()))?;
        Ok(Self)
    }
}

impl DecoderFactory for GstH264DecoderFactory {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecodeError> {
        Ok(Box::new(GstH264Decoder::new()?))
    }

    fn name(&self) -> &'static str {
        "avdec_h264"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use crate::rtsp_client::ConnectionState;
    use std::time::Duration;

    fn session(transport: TransportMode) -> StreamSession {
        StreamSession {
            id: 1,
            url: "rtsp://test:554/stream".to_string(),
            transport,
            connection_timeout: Duration::from_secs(5),
            buffer_ms: 100,
            state: ConnectionState::Connecting,
            attempt: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_pipeline_string_tcp() {
        let pipeline = build_pipeline_string(&session(TransportMode::Tcp));
        assert!(pipeline.contains("protocols=tcp"));
        assert!(pipeline.contains("rtsp://test:554/stream"));
        assert!(pipeline.contains("latency=100"));
    }

    #[test]
    fn test_pipeline_string_udp() {
        let pipeline = build_pipeline_string(&session(TransportMode::Udp));
        assert!(pipeline.contains("protocols=udp "));
    }

    fn playing_test_pipeline() -> gst::Pipeline {
        gst::init().unwrap();
        let pipeline = gst::parse::launch("fakesrc is-live=true ! fakesink sync=false")
            .unwrap()
            .downcast::<gst::Pipeline>()
            .unwrap();
        pipeline.set_state(gst::State::Playing).unwrap();
        pipeline
    }

    #[test]
    fn test_abandoned_open_returns_pipeline_to_null() {
        let pipeline = playing_test_pipeline();
        drop(NullOnDrop::new(pipeline.clone()));
        assert_eq!(pipeline.current_state(), gst::State::Null);
    }

    #[test]
    fn test_disarmed_guard_leaves_pipeline_running() {
        let pipeline = playing_test_pipeline();
        let kept = NullOnDrop::new(pipeline.clone()).disarm();
        assert_ne!(pipeline.current_state(), gst::State::Null);
        let _ = kept.set_state(gst::State::Null);
    }

    #[test]
    fn test_pipeline_stops_before_decode() {
        let pipeline = build_pipeline_string(&session(TransportMode::UdpMulticast));
        assert!(pipeline.contains("protocols=udp-mcast"));
        assert!(!pipeline.contains("avdec_h264"));
        assert!(pipeline.contains("stream-format=byte-stream"));
    }
}
