//! Frame processing and preprocessing for inference.
//!
//! Access units flow through three steps:
//!
//! 1. decode, on the blocking pool, with one decode context per session;
//! 2. rate gating against `target_fps`, before any pixel work is spent;
//! 3. normalization (resize and pixel format conversion) on a pool of
//!    worker threads, each owning its own scratch state.
//!
//! Workers may finish out of order. Results are collected through a
//! [`FuturesOrdered`], so frames leave the processor in decode order.

use crate::config::{PixelFormat, ProcessingConfig};
use crate::decoder::{DecodeError, DecoderFactory, FrameDecoder};
use crate::dispatch_queue::{DispatchSender, EnqueueOutcome, QueueError};
use crate::frame::{AccessUnit, NormalizedFrame, RawFrame, SourceInfo};
use crate::rtsp_client::SessionFault;
use crate::telemetry::{DropReason, Telemetry};
use bytes::Bytes;
use futures::stream::{FuturesOrdered, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Errors that can occur during frame processing.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported conversion from {from} to {to}")]
    UnsupportedConversion { from: PixelFormat, to: PixelFormat },

    #[error("Decoder unavailable: {0}")]
    Decoder(#[from] DecodeError),

    #[error("Failed to start normalization worker: {0}")]
    WorkerSpawn(String),

    #[error("Normalization worker exited")]
    WorkerGone,

    #[error("Decode task failed: {0}")]
    DecodeTask(String),

    #[error("Processor shutdown")]
    Shutdown,
}

/// Statistics for the frame processor.
#[derive(Debug, Default, Clone)]
pub struct ProcessorStats {
    pub frames_decoded: u64,
    pub frames_processed: u64,
    pub frames_dropped_rate_limit: u64,
    pub frames_dropped_backpressure: u64,
    pub decode_errors: u64,
    pub session_faults: u64,
    pub total_processing_time_us: u64,
    pub avg_processing_time_us: f64,
    pub last_frame_at: Option<Instant>,
}

/// Fixed-interval frame rate limiter.
///
/// A frame is admitted when its timestamp is at or after the next emit time,
/// which then moves one interval past the admitted frame. Admitted frames are
/// therefore always at least one interval apart.
#[derive(Debug, Clone)]
pub struct RateGate {
    interval: Duration,
    next_emit: Option<Instant>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_emit: None,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.frame_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.next_emit {
            Some(next) if now < next => false,
            _ => {
                self.next_emit = Some(now + self.interval);
                true
            }
        }
    }
}

/// Resizes and converts decoded frames to the inference format.
///
/// Keeps the source-to-target column mapping between calls, since the
/// source geometry rarely changes within a session.
#[derive(Debug)]
pub struct Normalizer {
    target_width: u32,
    target_height: u32,
    target_format: PixelFormat,
    column_map: Vec<usize>,
    column_map_key: (u32, usize),
}

impl Normalizer {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            target_width: config.target_width,
            target_height: config.target_height,
            target_format: config.pixel_format,
            column_map: Vec::new(),
            column_map_key: (0, 0),
        }
    }

    /// Normalize one frame, consuming it.
    pub fn normalize(&mut self, frame: RawFrame) -> Result<NormalizedFrame, ProcessingError> {
        let start = Instant::now();

        let expected = match frame.format.frame_size(frame.width, frame.height) {
            Some(expected) if expected > 0 && frame.data.len() >= expected => expected,
            _ => {
                return Err(ProcessingError::InvalidFormat(format!(
                    "{}x{} {} does not match {} bytes",
                    frame.width,
                    frame.height,
                    frame.format,
                    frame.data.len()
                )));
            }
        };

        let passthrough = frame.width == self.target_width
            && frame.height == self.target_height
            && frame.format == self.target_format;

        let RawFrame {
            mut data,
            width,
            height,
            format,
            source,
            session_id,
            sequence,
            discontinuity,
            captured_at,
            captured_at_wall,
            ..
        } = frame;

        let data = if passthrough {
            data.truncate(expected);
            Bytes::from(data)
        } else {
            Bytes::from(self.resize_and_convert(&data, width, height, format)?)
        };

        let processing_latency_us = start.elapsed().as_micros() as u64;
        let frame_id = format!("{}-{}-{}", source.device_id, session_id, sequence);

        Ok(NormalizedFrame {
            frame_id,
            source,
            data,
            width: self.target_width,
            height: self.target_height,
            pixel_format: self.target_format,
            original_width: width,
            original_height: height,
            session_id,
            sequence,
            discontinuity,
            captured_at,
            captured_at_wall,
            processing_latency_us,
            enqueued_at: None,
        })
    }

    /// Nearest-neighbour resize fused with pixel format conversion.
    fn resize_and_convert(
        &mut self,
        data: &[u8],
        src_width: u32,
        src_height: u32,
        src_format: PixelFormat,
    ) -> Result<Vec<u8>, ProcessingError> {
        let read = pixel_reader(src_format);
        let write = pixel_writer(self.target_format).ok_or(
            ProcessingError::UnsupportedConversion {
                from: src_format,
                to: self.target_format,
            },
        )?;

        let src_bpp = src_format.bytes_per_pixel();
        let dst_bpp = self.target_format.bytes_per_pixel();
        let src_stride = src_width as usize * src_bpp;

        self.update_column_map(src_width, src_bpp);

        let mut output = Vec::with_capacity(
            self.target_format
                .frame_size(self.target_width, self.target_height)
                .unwrap_or_default(),
        );
        let mut pixel = [0u8; 4];
        for y in 0..self.target_height as u64 {
            let src_y = (y * u64::from(src_height) / u64::from(self.target_height)) as usize;
            let row = &data[src_y * src_stride..(src_y + 1) * src_stride];
            for &offset in &self.column_map {
                let rgb = read(&row[offset..offset + src_bpp]);
                write(rgb, &mut pixel[..dst_bpp]);
                output.extend_from_slice(&pixel[..dst_bpp]);
            }
        }

        Ok(output)
    }

    fn update_column_map(&mut self, src_width: u32, src_bpp: usize) {
        if self.column_map_key == (src_width, src_bpp) && !self.column_map.is_empty() {
            return;
        }
        let dst_width = u64::from(self.target_width);
        self.column_map = (0..dst_width)
            .map(|x| (x * u64::from(src_width) / dst_width) as usize * src_bpp)
            .collect();
        self.column_map_key = (src_width, src_bpp);
    }
}

type PixelReader = fn(&[u8]) -> [u8; 3];
type PixelWriter = fn([u8; 3], &mut [u8]);

fn pixel_reader(format: PixelFormat) -> PixelReader {
    match format {
        PixelFormat::Rgb24 | PixelFormat::Rgba32 => |p| [p[0], p[1], p[2]],
        PixelFormat::Bgr24 => |p| [p[2], p[1], p[0]],
        PixelFormat::Gray8 => |p| [p[0], p[0], p[0]],
    }
}

fn pixel_writer(format: PixelFormat) -> Option<PixelWriter> {
    let writer: PixelWriter = match format {
        PixelFormat::Rgb24 => |rgb, out| out.copy_from_slice(&rgb),
        PixelFormat::Bgr24 => |[r, g, b], out| out.copy_from_slice(&[b, g, r]),
        PixelFormat::Gray8 => |rgb, out| out[0] = luma(rgb),
        PixelFormat::Rgba32 => return None,
    };
    Some(writer)
}

/// BT.601 luma in fixed point.
fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b)) >> 8) as u8
}

type NormalizeResult = Result<NormalizedFrame, ProcessingError>;

struct Job {
    frame: RawFrame,
    reply: oneshot::Sender<NormalizeResult>,
}

/// Fixed set of normalization threads.
///
/// Jobs are assigned round-robin. Each worker owns a private [`Normalizer`],
/// so no scratch state is shared between threads.
pub struct NormalizerPool {
    senders: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
}

impl NormalizerPool {
    pub fn new(config: &ProcessingConfig) -> Result<Self, ProcessingError> {
        let workers = config.num_workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Job>(2);
            let mut normalizer = Normalizer::new(config);

            let handle = std::thread::Builder::new()
                .name(format!("normalize-{}", worker_id))
                .spawn(move || {
                    debug!(worker_id, "Normalization worker started");
                    while let Some(job) = rx.blocking_recv() {
                        let _ = job.reply.send(normalizer.normalize(job.frame));
                    }
                    debug!(worker_id, "Normalization worker stopped");
                })
                .map_err(|e| ProcessingError::WorkerSpawn(e.to_string()))?;

            senders.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            senders,
            handles,
            next: 0,
        })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queue a frame on the next worker and return the pending result.
    pub async fn submit(
        &mut self,
        frame: RawFrame,
    ) -> Result<oneshot::Receiver<NormalizeResult>, ProcessingError> {
        let (reply, rx) = oneshot::channel();
        let sender = &self.senders[self.next];
        self.next = (self.next + 1) % self.senders.len();

        sender
            .send(Job { frame, reply })
            .await
            .map_err(|_| ProcessingError::WorkerGone)?;
        Ok(rx)
    }

    /// Close all worker queues and wait for the threads to exit.
    pub async fn shutdown(self) {
        drop(self.senders);
        let handles = self.handles;
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "Normalization workers did not stop cleanly");
        }
    }
}

/// Decode context, rate gate and per-session numbering.
///
/// Owned by value so it can be moved onto the blocking pool for each unit.
struct DecodeStage {
    decoder: Box<dyn FrameDecoder>,
    gate: RateGate,
    source: SourceInfo,
    max_failures: u32,
    telemetry: Arc<Telemetry>,
    stats: Arc<RwLock<ProcessorStats>>,
    faults: Option<mpsc::Sender<SessionFault>>,
    session_id: Option<u64>,
    next_sequence: u64,
    discontinuity: bool,
    consecutive_failures: u32,
}

impl DecodeStage {
    /// Decode one access unit and return the frames that pass the rate gate.
    fn decode_unit(&mut self, unit: AccessUnit) -> Vec<RawFrame> {
        if self.session_id != Some(unit.session_id) {
            if self.session_id.is_some() {
                if let Err(e) = self.decoder.reset() {
                    warn!(device_id = %self.source.device_id, error = %e, "Decoder reset failed");
                }
                self.discontinuity = true;
            }
            debug!(
                device_id = %self.source.device_id,
                session_id = unit.session_id,
                "New session, decode context reset"
            );
            self.session_id = Some(unit.session_id);
            self.next_sequence = 0;
            self.consecutive_failures = 0;
        }

        let images = match self.decoder.decode(&unit) {
            Ok(images) => {
                self.consecutive_failures = 0;
                images
            }
            Err(e) => {
                self.on_decode_failure(unit.session_id, e);
                return Vec::new();
            }
        };

        let captured_at_wall = SystemTime::now()
            .checked_sub(unit.received_at.elapsed())
            .unwrap_or(UNIX_EPOCH);
        let mut frames = Vec::with_capacity(images.len());
        for image in images {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.stats.write().frames_decoded += 1;

            if !self.gate.admit(unit.received_at) {
                self.telemetry.record_drop(DropReason::RateLimited);
                self.stats.write().frames_dropped_rate_limit += 1;
                trace!(
                    device_id = %self.source.device_id,
                    sequence,
                    "Frame dropped due to rate limiting"
                );
                continue;
            }

            frames.push(RawFrame {
                data: image.data,
                width: image.width,
                height: image.height,
                format: image.format,
                pts: image.pts,
                source: self.source.clone(),
                session_id: unit.session_id,
                sequence,
                discontinuity: std::mem::take(&mut self.discontinuity),
                captured_at: unit.received_at,
                captured_at_wall,
            });
        }
        frames
    }

    fn on_decode_failure(&mut self, session_id: u64, error: DecodeError) {
        self.consecutive_failures += 1;
        self.telemetry.record_drop(DropReason::DecodeError);
        self.stats.write().decode_errors += 1;
        debug!(
            device_id = %self.source.device_id,
            session_id,
            consecutive = self.consecutive_failures,
            error = %error,
            "Access unit dropped, decode failed"
        );

        if self.consecutive_failures < self.max_failures {
            return;
        }

        warn!(
            device_id = %self.source.device_id,
            session_id,
            failures = self.consecutive_failures,
            "Too many consecutive decode failures, recycling session"
        );
        self.consecutive_failures = 0;
        self.stats.write().session_faults += 1;

        if let Some(faults) = &self.faults {
            let fault = SessionFault {
                session_id,
                reason: format!(
                    "{} consecutive decode failures, last: {}",
                    self.max_failures, error
                ),
            };
            if faults.try_send(fault).is_err() {
                debug!(device_id = %self.source.device_id, "Session fault already pending");
            }
        }
    }
}

/// Frame processor for preparing camera frames for inference.
pub struct FrameProcessor {
    config: ProcessingConfig,
    source: SourceInfo,
    decoders: Arc<dyn DecoderFactory>,
    telemetry: Arc<Telemetry>,
    stats: Arc<RwLock<ProcessorStats>>,
    faults: Option<mpsc::Sender<SessionFault>>,
}

impl FrameProcessor {
    /// Create a new frame processor.
    pub fn new(
        config: ProcessingConfig,
        source: SourceInfo,
        decoders: Arc<dyn DecoderFactory>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            source,
            decoders,
            telemetry,
            stats: Arc::new(RwLock::new(ProcessorStats::default())),
            faults: None,
        }
    }

    /// Where to report sessions that keep producing undecodable data.
    pub fn with_fault_sender(mut self, faults: mpsc::Sender<SessionFault>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Get current processor statistics.
    pub fn stats(&self) -> ProcessorStats {
        self.stats.read().clone()
    }

    pub fn stats_handle(&self) -> Arc<RwLock<ProcessorStats>> {
        self.stats.clone()
    }

    /// Process access units until the input closes or `shutdown` fires.
    ///
    /// On input close, frames already in flight are still delivered.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<AccessUnit>,
        output: DispatchSender,
        shutdown: CancellationToken,
    ) -> Result<(), ProcessingError> {
        let mut pool = NormalizerPool::new(&self.config)?;
        let max_in_flight = pool.workers() * 2;
        let mut stage = DecodeStage {
            decoder: self.decoders.create()?,
            gate: RateGate::from_config(&self.config),
            source: self.source.clone(),
            max_failures: self.config.max_consecutive_decode_failures,
            telemetry: self.telemetry.clone(),
            stats: self.stats.clone(),
            faults: self.faults.take(),
            session_id: None,
            next_sequence: 0,
            discontinuity: false,
            consecutive_failures: 0,
        };
        let mut pending = FuturesOrdered::new();
        let mut input_open = true;

        info!(
            device_id = %self.source.device_id,
            decoder = self.decoders.name(),
            target_width = self.config.target_width,
            target_height = self.config.target_height,
            target_fps = self.config.target_fps,
            workers = pool.workers(),
            "Frame processor started"
        );

        let result = 'run: loop {
            if !input_open && pending.is_empty() {
                break Ok(());
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'run Ok(()),
                Some(done) = pending.next(), if !pending.is_empty() => {
                    let Ok(normalized) = done else {
                        break 'run Err(ProcessingError::WorkerGone);
                    };
                    match self.forward(normalized, &output, &shutdown).await {
                        Ok(()) => {}
                        Err(QueueError::Cancelled) => break 'run Ok(()),
                        Err(QueueError::Closed) => break 'run Err(ProcessingError::Shutdown),
                    }
                }
                unit = input.recv(), if input_open && pending.len() < max_in_flight => {
                    let Some(unit) = unit else {
                        debug!(device_id = %self.source.device_id, "Input channel closed");
                        input_open = false;
                        continue;
                    };
                    let decoded = tokio::task::spawn_blocking(move || {
                        let frames = stage.decode_unit(unit);
                        (stage, frames)
                    })
                    .await;
                    let frames = match decoded {
                        Ok((returned, frames)) => {
                            stage = returned;
                            frames
                        }
                        Err(e) => break 'run Err(ProcessingError::DecodeTask(e.to_string())),
                    };
                    for frame in frames {
                        match pool.submit(frame).await {
                            Ok(rx) => pending.push_back(rx),
                            Err(e) => break 'run Err(e),
                        }
                    }
                }
            }
        };

        pool.shutdown().await;
        info!(device_id = %self.source.device_id, "Frame processor stopped");
        result
    }

    /// Push a normalized frame into the dispatch queue, updating stats.
    async fn forward(
        &self,
        normalized: NormalizeResult,
        output: &DispatchSender,
        shutdown: &CancellationToken,
    ) -> Result<(), QueueError> {
        let frame = match normalized {
            Ok(frame) => frame,
            Err(e) => {
                self.telemetry.record_drop(DropReason::DecodeError);
                warn!(device_id = %self.source.device_id, error = %e, "Frame processing error");
                return Ok(());
            }
        };

        let latency_us = frame.processing_latency_us;
        self.telemetry
            .record_processing_latency(frame.captured_at.elapsed());

        match output.enqueue(frame, shutdown).await? {
            EnqueueOutcome::Enqueued => {
                let mut stats = self.stats.write();
                stats.frames_processed += 1;
                stats.total_processing_time_us += latency_us;
                stats.avg_processing_time_us =
                    stats.total_processing_time_us as f64 / stats.frames_processed as f64;
                stats.last_frame_at = Some(Instant::now());
            }
            EnqueueOutcome::Dropped => {
                self.stats.write().frames_dropped_backpressure += 1;
            }
        }
        Ok(())
    }
}
