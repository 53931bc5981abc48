//! Pipeline counters and latency histograms.
//!
//! A single [`Telemetry`] instance is created per process and handed to every
//! pipeline stage. Each update is kept locally (for stats logging and tests)
//! and forwarded to the `metrics` facade, so whichever exporter the binary
//! installs sees the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why a frame never reached the inference service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived before the rate gate reopened
    RateLimited,
    /// Dispatch queue was full
    Backpressure,
    /// Access unit could not be decoded
    DecodeError,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::RateLimited => "rate_limited",
            DropReason::Backpressure => "backpressure",
            DropReason::DecodeError => "decode_error",
        }
    }
}

/// Final outcome of one batch exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Success,
    Failure,
}

impl SubmissionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionOutcome::Success => "success",
            SubmissionOutcome::Failure => "failure",
        }
    }
}

/// Upper bucket bounds in milliseconds; the last bucket is unbounded.
const LATENCY_BUCKETS_MS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Lock-free latency histogram with fixed buckets.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);

        let ms = us / 1000;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms < bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_us: u64,
    pub max_us: u64,
    pub buckets: Vec<u64>,
}

impl HistogramSnapshot {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_us as f64 / self.count as f64 / 1000.0
        }
    }
}

/// Process-wide pipeline telemetry.
#[derive(Debug, Default)]
pub struct Telemetry {
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    dropped_rate_limited: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_decode_error: AtomicU64,
    frames_sent: AtomicU64,
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    rtsp_reconnects: AtomicU64,
    processing_latency: LatencyHistogram,
    submission_success: LatencyHistogram,
    submission_failure: LatencyHistogram,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One access unit arrived from the camera.
    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("frames_received_total").increment(1);
        metrics::counter!("bytes_received_total").increment(bytes as u64);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::RateLimited => &self.dropped_rate_limited,
            DropReason::Backpressure => &self.dropped_backpressure,
            DropReason::DecodeError => &self.dropped_decode_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped_total", "reason" => reason.as_str()).increment(1);
        if reason == DropReason::DecodeError {
            metrics::counter!("decode_errors_total").increment(1);
        }
    }

    /// Only called on `Streaming -> Reconnecting` transitions.
    pub fn record_reconnect(&self) {
        self.rtsp_reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rtsp_reconnects_total").increment(1);
    }

    pub fn record_processing_latency(&self, latency: Duration) {
        self.processing_latency.record(latency);
        metrics::histogram!("processing_latency_seconds").record(latency.as_secs_f64());
    }

    /// Record a completed exchange. `accepted` and `rejected` are the per-frame
    /// counts reported by the server and are only meaningful on success.
    pub fn record_submission(
        &self,
        outcome: SubmissionOutcome,
        frames: usize,
        accepted: usize,
        rejected: usize,
        latency: Duration,
    ) {
        let frames = frames as u64;
        match outcome {
            SubmissionOutcome::Success => {
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.frames_sent.fetch_add(frames, Ordering::Relaxed);
                self.frames_accepted
                    .fetch_add(accepted as u64, Ordering::Relaxed);
                self.frames_rejected
                    .fetch_add(rejected as u64, Ordering::Relaxed);
                self.submission_success.record(latency);
                metrics::counter!("frames_sent_total").increment(frames);
                metrics::counter!("batches_sent_total").increment(1);
            }
            SubmissionOutcome::Failure => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.submission_failure.record(latency);
                metrics::counter!("batches_failed_total").increment(1);
            }
        }
        metrics::histogram!("submission_latency_seconds", "outcome" => outcome.as_str())
            .record(latency.as_secs_f64());
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_rate_limited: self.dropped_rate_limited.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            dropped_decode_error: self.dropped_decode_error.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            rtsp_reconnects: self.rtsp_reconnects.load(Ordering::Relaxed),
            processing_latency: self.processing_latency.snapshot(),
            submission_success: self.submission_success.snapshot(),
            submission_failure: self.submission_failure.snapshot(),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub dropped_rate_limited: u64,
    pub dropped_backpressure: u64,
    pub dropped_decode_error: u64,
    pub frames_sent: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub rtsp_reconnects: u64,
    pub processing_latency: HistogramSnapshot,
    pub submission_success: HistogramSnapshot,
    pub submission_failure: HistogramSnapshot,
}

impl TelemetrySnapshot {
    pub fn frames_dropped(&self) -> u64 {
        self.dropped_rate_limited + self.dropped_backpressure + self.dropped_decode_error
    }

    /// Mean latency over every completed exchange, successful or not.
    pub fn avg_submission_latency_ms(&self) -> f64 {
        let count = self.submission_success.count + self.submission_failure.count;
        if count == 0 {
            return 0.0;
        }
        let sum = self.submission_success.sum_us + self.submission_failure.sum_us;
        sum as f64 / count as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_reasons_are_separate() {
        let telemetry = Telemetry::new();
        telemetry.record_drop(DropReason::RateLimited);
        telemetry.record_drop(DropReason::RateLimited);
        telemetry.record_drop(DropReason::Backpressure);

        let snap = telemetry.snapshot();
        assert_eq!(snap.dropped_rate_limited, 2);
        assert_eq!(snap.dropped_backpressure, 1);
        assert_eq!(snap.dropped_decode_error, 0);
        assert_eq!(snap.frames_dropped(), 3);
    }

    #[test]
    fn test_submission_outcomes() {
        let telemetry = Telemetry::new();
        telemetry.record_submission(
            SubmissionOutcome::Success,
            4,
            4,
            0,
            Duration::from_millis(20),
        );
        telemetry.record_submission(
            SubmissionOutcome::Failure,
            3,
            0,
            0,
            Duration::from_millis(40),
        );

        let snap = telemetry.snapshot();
        assert_eq!(snap.frames_sent, 4);
        assert_eq!(snap.batches_sent, 1);
        assert_eq!(snap.batches_failed, 1);
        assert_eq!(snap.submission_success.count, 1);
        assert_eq!(snap.submission_failure.count, 1);
        assert!((snap.avg_submission_latency_ms() - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = LatencyHistogram::default();
        histogram.record(Duration::from_micros(500));
        histogram.record(Duration::from_millis(30));
        histogram.record(Duration::from_secs(10));

        let snap = histogram.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.max_us, 10_000_000);
        assert_eq!(snap.buckets[0], 1);
        assert_eq!(snap.buckets[4], 1);
        assert_eq!(*snap.buckets.last().unwrap(), 1);
        assert_eq!(snap.buckets.iter().sum::<u64>(), 3);
    }
}
