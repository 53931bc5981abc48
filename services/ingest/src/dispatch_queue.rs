//! Bounded hand-off between normalization and batch submission.
//!
//! Holds at most `queue_size` frames. When full, the producer either drops
//! the new frame (counted as a backpressure drop) or waits for space,
//! depending on `drop_on_backpressure`. Frames leave in the order they
//! entered.

use crate::frame::NormalizedFrame;
use crate::telemetry::{DropReason, Telemetry};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Dispatch queue closed")]
    Closed,

    #[error("Enqueue cancelled by shutdown")]
    Cancelled,
}

/// Result of a successful enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Queue was full and the frame was discarded
    Dropped,
}

/// Create a dispatch queue holding at most `capacity` frames.
pub fn dispatch_queue(
    capacity: usize,
    drop_on_backpressure: bool,
    telemetry: Arc<Telemetry>,
) -> (DispatchSender, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        DispatchSender {
            tx,
            drop_on_backpressure,
            telemetry,
        },
        DispatchReceiver { rx },
    )
}

/// Producer half, owned by the frame processor.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::Sender<NormalizedFrame>,
    drop_on_backpressure: bool,
    telemetry: Arc<Telemetry>,
}

impl DispatchSender {
    /// Hand a frame to the submitter.
    ///
    /// In drop mode this never waits. In block mode it waits for space and
    /// returns [`QueueError::Cancelled`] if `shutdown` fires first.
    pub async fn enqueue(
        &self,
        mut frame: NormalizedFrame,
        shutdown: &CancellationToken,
    ) -> Result<EnqueueOutcome, QueueError> {
        frame.enqueued_at = Some(Instant::now());

        if self.drop_on_backpressure {
            return match self.tx.try_send(frame) {
                Ok(()) => Ok(EnqueueOutcome::Enqueued),
                Err(TrySendError::Full(frame)) => {
                    self.telemetry.record_drop(DropReason::Backpressure);
                    trace!(
                        device_id = %frame.source.device_id,
                        sequence = frame.sequence,
                        "Frame dropped due to backpressure"
                    );
                    Ok(EnqueueOutcome::Dropped)
                }
                Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            };
        }

        tokio::select! {
            _ = shutdown.cancelled() => Err(QueueError::Cancelled),
            sent = self.tx.send(frame) => sent
                .map(|()| EnqueueOutcome::Enqueued)
                .map_err(|_| QueueError::Closed),
        }
    }

    /// Frames currently waiting in the queue.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the batch submitter.
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::Receiver<NormalizedFrame>,
}

impl DispatchReceiver {
    /// Next frame in FIFO order, `None` once every sender is gone and the
    /// queue is empty. Cancel safe.
    pub async fn dequeue(&mut self) -> Option<NormalizedFrame> {
        self.rx.recv().await
    }
}
