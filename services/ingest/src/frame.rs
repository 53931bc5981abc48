//! Data carried between pipeline stages.
//!
//! Frames are deliberately not `Clone`: every stage takes ownership of the
//! frame it works on and hands it on by value, so a pixel buffer is never
//! visible to two stages at once.

use crate::config::PixelFormat;
use bytes::Bytes;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// One compressed access unit received from the camera.
#[derive(Debug)]
pub struct AccessUnit {
    /// Encoded payload (H.264 byte-stream for the GStreamer source)
    pub data: Bytes,

    /// Presentation timestamp in nanoseconds, when the source provides one
    pub pts: Option<u64>,

    /// Session that produced this unit
    pub session_id: u64,

    /// Receive time on this host
    pub received_at: Instant,
}

/// Identity of the camera a frame came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub device_id: String,
    pub worker_id: Option<String>,
    pub zone_id: Option<String>,
}

/// A decoded picture as produced by a [`crate::decoder::FrameDecoder`],
/// before it is stamped with stream identity.
#[derive(Debug)]
pub struct DecodedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: Option<u64>,
}

/// A raw frame extracted from the RTSP stream.
#[derive(Debug)]
pub struct RawFrame {
    /// Frame data as bytes
    pub data: Vec<u8>,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel format of `data`
    pub format: PixelFormat,

    /// Presentation timestamp
    pub pts: Option<u64>,

    /// Camera identity
    pub source: SourceInfo,

    /// Session the frame belongs to
    pub session_id: u64,

    /// Frame sequence number, strictly increasing within a session
    pub sequence: u64,

    /// First frame of a session that replaced an earlier one
    pub discontinuity: bool,

    /// Timestamp when frame was captured
    pub captured_at: Instant,

    /// Wall clock capture time, for the wire format
    pub captured_at_wall: SystemTime,
}

/// A processed frame ready for inference.
#[derive(Debug)]
pub struct NormalizedFrame {
    /// Unique frame identifier
    pub frame_id: String,

    /// Camera identity
    pub source: SourceInfo,

    /// Processed frame data
    pub data: Bytes,

    /// Frame width after processing
    pub width: u32,

    /// Frame height after processing
    pub height: u32,

    /// Pixel format after processing
    pub pixel_format: PixelFormat,

    /// Original frame dimensions
    pub original_width: u32,
    pub original_height: u32,

    pub session_id: u64,
    pub sequence: u64,
    pub discontinuity: bool,

    /// Timestamp when original frame was captured
    pub captured_at: Instant,
    pub captured_at_wall: SystemTime,

    /// Processing latency in microseconds
    pub processing_latency_us: u64,

    /// Set when the frame enters the dispatch queue
    pub enqueued_at: Option<Instant>,
}

impl NormalizedFrame {
    /// Capture time in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.captured_at_wall
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// What closed a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Reached `batch_size`
    Size,
    /// `batch_timeout_ms` elapsed since the first frame
    Timeout,
    /// Upstream closed with a partial batch pending
    Drain,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Drain => "drain",
        }
    }
}

/// An ordered group of frames submitted in one exchange.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    pub frames: Vec<NormalizedFrame>,
    pub created_at: Instant,
    pub flush_reason: FlushReason,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sequence numbers in batch order.
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.sequence).collect()
    }
}
