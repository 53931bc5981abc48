//! Batching and concurrent submission to the inference service.
//!
//! Frames are grouped in dispatch order. A batch closes when it reaches
//! `batch_size`, when `batch_timeout_ms` has passed since its first frame, or
//! when the dispatch queue closes. Each closed batch is one exchange; at most
//! `max_concurrent_requests` exchanges run at a time, and the submitter stops
//! pulling from the queue while all permits are taken.

use crate::config::GrpcConfig;
use crate::dispatch_queue::DispatchReceiver;
use crate::frame::{Batch, FlushReason, NormalizedFrame};
use crate::grpc_client::{BatchAck, InferenceClient, SubmitError};
use crate::telemetry::{SubmissionOutcome, Telemetry};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collects frames into batches.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_size: usize,
    timeout: Duration,
    frames: Vec<NormalizedFrame>,
    opened_at: Option<Instant>,
    next_id: u64,
}

impl BatchAccumulator {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            timeout,
            frames: Vec::with_capacity(max_size),
            opened_at: None,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// When the open batch must be flushed, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.timeout)
    }

    /// Add a frame; returns the batch if it is now full.
    pub fn push(&mut self, frame: NormalizedFrame, now: Instant) -> Option<Batch> {
        if self.frames.is_empty() {
            self.opened_at = Some(now);
        }
        self.frames.push(frame);

        if self.frames.len() >= self.max_size {
            self.flush(FlushReason::Size)
        } else {
            None
        }
    }

    /// Close the open batch, if any.
    pub fn flush(&mut self, reason: FlushReason) -> Option<Batch> {
        if self.frames.is_empty() {
            return None;
        }

        let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(self.max_size));
        let created_at = self
            .opened_at
            .take()
            .map_or_else(std::time::Instant::now, Instant::into_std);
        let id = self.next_id;
        self.next_id += 1;

        Some(Batch {
            id,
            frames,
            created_at,
            flush_reason: reason,
        })
    }
}

/// Counters for batches the submitter has closed.
#[derive(Debug, Default, Clone)]
pub struct BatcherStats {
    pub batches_created: u64,
    pub flushed_by_size: u64,
    pub flushed_by_timeout: u64,
    pub flushed_by_drain: u64,
    pub frames_discarded_on_shutdown: u64,
    pub exchanges_aborted: u64,
}

/// Per-exchange settings shared with spawned submissions.
#[derive(Debug, Clone)]
struct ExchangeSettings {
    request_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

/// Drains the dispatch queue into batches and submits them concurrently.
pub struct BatchingClient {
    client: Arc<dyn InferenceClient>,
    config: GrpcConfig,
    telemetry: Arc<Telemetry>,
    semaphore: Arc<Semaphore>,
    stats: Arc<RwLock<BatcherStats>>,
}

impl BatchingClient {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        config: GrpcConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let permits = config.max_concurrent_requests.max(1);
        Self {
            client,
            config,
            telemetry,
            semaphore: Arc::new(Semaphore::new(permits)),
            stats: Arc::new(RwLock::new(BatcherStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<RwLock<BatcherStats>> {
        self.stats.clone()
    }

    fn settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            request_timeout: self.config.request_timeout(),
            max_retries: self.config.max_retries,
            retry_base_delay: self.config.retry_base_delay(),
        }
    }

    /// Run until the dispatch queue closes or `shutdown` fires.
    ///
    /// On queue close the partial batch is flushed and every in-flight
    /// exchange is awaited. On shutdown the partial batch is discarded and
    /// in-flight exchanges get `shutdown_grace_ms` before being aborted.
    pub async fn run(self, mut input: DispatchReceiver, shutdown: CancellationToken) {
        let mut accumulator =
            BatchAccumulator::new(self.config.batch_size, self.config.batch_timeout());
        let mut in_flight = JoinSet::new();

        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            max_concurrent = self.config.max_concurrent_requests,
            "Batch submitter started"
        );

        let drained = loop {
            let deadline = accumulator.deadline();

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break false,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Submission task failed");
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = accumulator.flush(FlushReason::Timeout) {
                        if !self.dispatch(batch, &mut in_flight, &shutdown).await {
                            break false;
                        }
                    }
                }
                frame = input.dequeue() => {
                    let Some(frame) = frame else {
                        if let Some(batch) = accumulator.flush(FlushReason::Drain) {
                            if !self.dispatch(batch, &mut in_flight, &shutdown).await {
                                break false;
                            }
                        }
                        break true;
                    };
                    if let Some(batch) = accumulator.push(frame, Instant::now()) {
                        if !self.dispatch(batch, &mut in_flight, &shutdown).await {
                            break false;
                        }
                    }
                }
            }
        };

        if !accumulator.is_empty() {
            self.stats.write().frames_discarded_on_shutdown += accumulator.len() as u64;
            debug!(frames = accumulator.len(), "Discarding partial batch on shutdown");
        }

        let all_done = if drained {
            tokio::select! {
                _ = async { while in_flight.join_next().await.is_some() {} } => true,
                _ = shutdown.cancelled() => false,
            }
        } else {
            false
        };

        if !all_done {
            self.finish_with_grace(&mut in_flight).await;
        }

        info!("Batch submitter stopped");
    }

    async fn finish_with_grace(&self, in_flight: &mut JoinSet<()>) {
        let grace = self.config.shutdown_grace();
        let waited = timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            let aborted = in_flight.len();
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            self.stats.write().exchanges_aborted += aborted as u64;
            warn!(
                aborted,
                grace_ms = grace.as_millis() as u64,
                "Aborted in-flight submissions after shutdown grace period"
            );
        }
    }

    /// Wait for a permit and start the exchange. Returns false if shutdown
    /// fired first; the batch is then dropped.
    async fn dispatch(
        &self,
        batch: Batch,
        in_flight: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> bool {
        {
            let mut stats = self.stats.write();
            stats.batches_created += 1;
            match batch.flush_reason {
                FlushReason::Size => stats.flushed_by_size += 1,
                FlushReason::Timeout => stats.flushed_by_timeout += 1,
                FlushReason::Drain => stats.flushed_by_drain += 1,
            }
        }
        debug!(
            batch_id = batch.id,
            frames = batch.len(),
            reason = batch.flush_reason.as_str(),
            age_ms = batch.created_at.elapsed().as_millis() as u64,
            "Batch closed"
        );

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                self.stats.write().frames_discarded_on_shutdown += batch.len() as u64;
                return false;
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        in_flight.spawn(submit(
            self.client.clone(),
            batch,
            self.settings(),
            self.telemetry.clone(),
            permit,
        ));
        true
    }
}

/// One exchange, with optional retries, recorded in telemetry.
async fn submit(
    client: Arc<dyn InferenceClient>,
    batch: Batch,
    settings: ExchangeSettings,
    telemetry: Arc<Telemetry>,
    _permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let result = exchange_with_retry(client.as_ref(), &batch, &settings).await;
    let latency = started.elapsed();

    match result {
        Ok(ack) => {
            telemetry.record_submission(
                SubmissionOutcome::Success,
                batch.len(),
                ack.accepted,
                ack.rejected,
                latency,
            );
            debug!(
                batch_id = batch.id,
                frames = batch.len(),
                accepted = ack.accepted,
                latency_ms = latency.as_millis() as u64,
                "Batch submitted"
            );
        }
        Err(e) => {
            telemetry.record_submission(SubmissionOutcome::Failure, batch.len(), 0, 0, latency);
            warn!(
                batch_id = batch.id,
                frames = batch.len(),
                first_sequence = batch.frames.first().map(|f| f.sequence),
                error = %e,
                "Batch submission failed"
            );
        }
    }
}

async fn exchange_with_retry(
    client: &dyn InferenceClient,
    batch: &Batch,
    settings: &ExchangeSettings,
) -> Result<BatchAck, SubmitError> {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(settings.retry_base_delay)
        .with_max_elapsed_time(None)
        .build();
    let mut attempt = 0u32;

    loop {
        let result = timeout(settings.request_timeout, client.submit_batch(batch))
            .await
            .unwrap_or(Err(SubmitError::Timeout(settings.request_timeout)));

        match result {
            Err(e) if e.is_retryable() && attempt < settings.max_retries => {
                attempt += 1;
                let delay = backoff.next_backoff().unwrap_or(settings.retry_base_delay);
                debug!(
                    batch_id = batch.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying batch"
                );
                sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatch_queue::dispatch_queue;
    use crate::dispatch_queue::tests::create_test_frame;
    use crate::grpc_client::ServiceHealth;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every batch it receives.
    pub(crate) struct RecordingClient {
        pub(crate) batches: Mutex<Vec<(Duration, Vec<u64>)>>,
        delay: Duration,
        failures_left: AtomicUsize,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        origin: Instant,
    }

    impl RecordingClient {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                delay,
                failures_left: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                origin: Instant::now(),
            }
        }

        /// Fail the first `n` calls with `Unavailable`.
        pub(crate) fn failing(delay: Duration, n: usize) -> Self {
            let client = Self::new(delay);
            client.failures_left.store(n, Ordering::SeqCst);
            client
        }

        pub(crate) fn sequences(&self) -> Vec<Vec<u64>> {
            self.batches.lock().iter().map(|(_, s)| s.clone()).collect()
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InferenceClient for RecordingClient {
        async fn submit_batch(&self, batch: &Batch) -> Result<BatchAck, SubmitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SubmitError::from(tonic::Status::unavailable("busy")));
            }

            self.batches
                .lock()
                .push((self.origin.elapsed(), batch.sequences()));
            Ok(BatchAck {
                accepted: batch.len(),
                rejected: 0,
                server_time_ms: 1.0,
            })
        }

        async fn health_check(&self, _device_id: &str) -> Result<ServiceHealth, SubmitError> {
            Ok(ServiceHealth::Healthy)
        }
    }

    fn grpc_config(batch_size: usize, batch_timeout_ms: u64) -> GrpcConfig {
        let mut config = crate::config::tests::create_test_config().grpc;
        config.batch_size = batch_size;
        config.batch_timeout_ms = batch_timeout_ms;
        config.request_timeout_secs = 1;
        config.max_concurrent_requests = 4;
        config.shutdown_grace_ms = 500;
        config
    }

    #[test]
    fn test_accumulator_size_flush() {
        let mut acc = BatchAccumulator::new(4, Duration::from_millis(100));
        let now = Instant::now();
        for seq in 0..3 {
            assert!(acc.push(create_test_frame(seq), now).is_none());
        }
        assert_eq!(acc.deadline(), Some(now + Duration::from_millis(100)));

        let batch = acc.push(create_test_frame(3), now).unwrap();
        assert_eq!(batch.id, 1);
        assert_eq!(batch.sequences(), vec![0, 1, 2, 3]);
        assert_eq!(batch.flush_reason, FlushReason::Size);
        assert!(acc.is_empty());
        assert_eq!(acc.deadline(), None);
    }

    #[test]
    fn test_batch_age_starts_at_first_frame() {
        let mut acc = BatchAccumulator::new(4, Duration::from_millis(100));
        let opened = Instant::now();
        acc.push(create_test_frame(0), opened);
        acc.push(create_test_frame(1), opened + Duration::from_millis(60));

        let batch = acc.flush(FlushReason::Timeout).unwrap();
        assert_eq!(batch.created_at, opened.into_std());

        // The next batch opens with its own first frame
        let later = opened + Duration::from_millis(500);
        assert!(acc.push(create_test_frame(2), later).is_none());
        let batch = acc.flush(FlushReason::Drain).unwrap();
        assert_eq!(batch.created_at, later.into_std());
    }

    #[test]
    fn test_accumulator_ids_increase() {
        let mut acc = BatchAccumulator::new(1, Duration::from_millis(100));
        let now = Instant::now();
        let ids: Vec<u64> = (0..3)
            .filter_map(|seq| acc.push(create_test_frame(seq), now))
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(acc.flush(FlushReason::Drain).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_submits_immediately() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::from_millis(5)));
        let (tx, rx) = dispatch_queue(16, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        let submitter = BatchingClient::new(client.clone(), grpc_config(4, 10_000), telemetry.clone());
        let task = tokio::spawn(submitter.run(rx, shutdown.clone()));

        for seq in 0..4 {
            tx.enqueue(create_test_frame(seq), &shutdown).await.unwrap();
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(client.sequences(), vec![vec![0, 1, 2, 3]]);
        assert!(client.batches.lock()[0].0 < Duration::from_millis(10));

        drop(tx);
        task.await.unwrap();
        assert_eq!(telemetry.snapshot().batches_sent, 1);
        assert_eq!(telemetry.snapshot().frames_sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flush_partial_batch() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::ZERO));
        let (tx, rx) = dispatch_queue(16, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        let submitter = BatchingClient::new(client.clone(), grpc_config(4, 100), telemetry.clone());
        let stats = submitter.stats_handle();
        let task = tokio::spawn(submitter.run(rx, shutdown.clone()));

        tx.enqueue(create_test_frame(0), &shutdown).await.unwrap();
        tx.enqueue(create_test_frame(1), &shutdown).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        let batches = client.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec![0, 1]);
        assert!(batches[0].0 >= Duration::from_millis(100));
        assert!(batches[0].0 < Duration::from_millis(110));
        assert_eq!(stats.read().flushed_by_timeout, 1);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_exceed_size() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::from_millis(1)));
        let (tx, rx) = dispatch_queue(32, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        for seq in 0..10 {
            tx.enqueue(create_test_frame(seq), &shutdown).await.unwrap();
        }
        drop(tx);

        let submitter = BatchingClient::new(client.clone(), grpc_config(4, 10_000), telemetry.clone());
        let stats = submitter.stats_handle();
        submitter.run(rx, shutdown).await;

        let mut batches = client.sequences();
        batches.sort();
        assert_eq!(
            batches,
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
        assert_eq!(stats.read().flushed_by_size, 2);
        assert_eq!(stats.read().flushed_by_drain, 1);
        assert_eq!(telemetry.snapshot().frames_sent, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::from_millis(50)));
        let (tx, rx) = dispatch_queue(32, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        for seq in 0..8 {
            tx.enqueue(create_test_frame(seq), &shutdown).await.unwrap();
        }
        drop(tx);

        let mut config = grpc_config(1, 100);
        config.max_concurrent_requests = 2;
        let start = Instant::now();
        BatchingClient::new(client.clone(), config, telemetry.clone())
            .run(rx, shutdown)
            .await;

        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(client.sequences().len(), 8);
        // Four waves of two exchanges.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::failing(Duration::from_millis(1), 2));
        let (tx, rx) = dispatch_queue(8, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        for seq in 0..3 {
            tx.enqueue(create_test_frame(seq), &shutdown).await.unwrap();
        }
        drop(tx);

        let mut config = grpc_config(1, 100);
        config.max_concurrent_requests = 1;
        BatchingClient::new(client.clone(), config, telemetry.clone())
            .run(rx, shutdown)
            .await;

        let snap = telemetry.snapshot();
        assert_eq!(snap.batches_failed, 2);
        assert_eq!(snap.batches_sent, 1);
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_transient_failure() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::failing(Duration::from_millis(1), 1));
        let (tx, rx) = dispatch_queue(8, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        tx.enqueue(create_test_frame(0), &shutdown).await.unwrap();
        drop(tx);

        let mut config = grpc_config(1, 100);
        config.max_retries = 2;
        BatchingClient::new(client.clone(), config, telemetry.clone())
            .run(rx, shutdown)
            .await;

        let snap = telemetry.snapshot();
        assert_eq!(snap.batches_sent, 1);
        assert_eq!(snap.batches_failed, 0);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_fails_batch() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::from_secs(5)));
        let (tx, rx) = dispatch_queue(8, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        tx.enqueue(create_test_frame(0), &shutdown).await.unwrap();
        drop(tx);

        let start = Instant::now();
        BatchingClient::new(client.clone(), grpc_config(1, 100), telemetry.clone())
            .run(rx, shutdown)
            .await;

        assert_eq!(telemetry.snapshot().batches_failed, 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_grace() {
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::from_secs(60)));
        let (tx, rx) = dispatch_queue(8, true, telemetry.clone());
        let shutdown = CancellationToken::new();

        let mut config = grpc_config(1, 100);
        config.request_timeout_secs = 120;
        let submitter = BatchingClient::new(client.clone(), config, telemetry.clone());
        let stats = submitter.stats_handle();
        let task = tokio::spawn(submitter.run(rx, shutdown.clone()));

        tx.enqueue(create_test_frame(0), &shutdown).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        shutdown.cancel();
        task.await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(stats.read().exchanges_aborted, 1);
        assert_eq!(telemetry.snapshot().batches_sent, 0);
    }
}
