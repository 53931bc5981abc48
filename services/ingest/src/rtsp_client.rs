//! RTSP client with automatic reconnection and stream management.
//!
//! The [`StreamConnector`] owns the session lifecycle for one camera:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Reconnecting -> Connecting ...
//!                                                        \-> Terminated
//! ```
//!
//! The actual transport is behind [`MediaSource`], so the state machine is the
//! same for GStreamer, the synthetic source and test doubles.

use crate::config::{RtspConfig, TransportMode};
use crate::frame::AccessUnit;
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur during RTSP operations.
#[derive(Debug, Error)]
pub enum RtspError {
    #[error("GStreamer initialization failed: {0}")]
    GstreamerInit(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Pipeline element not found: {0}")]
    ElementNotFound(String),

    #[error("Stream connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("No data received for {0:?}")]
    ReceiveTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Session recycled: {0}")]
    SessionFault(String),

    #[error("Unsupported source URL: {0}")]
    UnsupportedUrl(String),

    #[error("Maximum reconnection attempts exceeded after {attempts} attempts: {last_error}")]
    MaxReconnectAttemptsExceeded { attempts: u32, last_error: String },
}

/// State of the RTSP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Terminated,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Terminated => "terminated",
        }
    }
}

/// One logical connection attempt to the camera.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: u64,
    pub url: String,
    pub transport: TransportMode,
    pub connection_timeout: Duration,
    pub buffer_ms: u32,
    pub state: ConnectionState,
    /// Reconnect attempts made before this session was opened
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl StreamSession {
    fn new(id: u64, config: &RtspConfig, attempt: u32) -> Self {
        Self {
            id,
            url: config.url.clone(),
            transport: config.transport,
            connection_timeout: config.connection_timeout(),
            buffer_ms: config.buffer_ms,
            state: ConnectionState::Connecting,
            attempt,
            last_error: None,
        }
    }
}

/// An encoded payload as delivered by a [`MediaStream`].
#[derive(Debug)]
pub struct MediaPacket {
    pub data: Bytes,
    pub pts: Option<u64>,
}

/// Opens media sessions against a camera.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Establish a session. The connector bounds this call by the session's
    /// connection timeout.
    async fn open(&self, session: &StreamSession) -> Result<Box<dyn MediaStream>, RtspError>;
}

/// An established media session.
#[async_trait]
pub trait MediaStream: Send {
    /// Next encoded access unit, `Ok(None)` at end of stream.
    ///
    /// Must be cancel safe: the connector may drop the returned future when a
    /// shutdown or a session fault wins the race.
    async fn next_unit(&mut self) -> Result<Option<MediaPacket>, RtspError>;
}

/// Request from a downstream stage to recycle the current session.
#[derive(Debug, Clone)]
pub struct SessionFault {
    pub session_id: u64,
    pub reason: String,
}

/// Statistics for the RTSP stream.
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub reconnect_count: u32,
    pub sessions_opened: u64,
    pub last_frame_at: Option<Instant>,
    pub stream_start: Option<Instant>,
    pub current_fps: f64,
    pub last_error: Option<String>,
}

/// Exponential reconnect backoff: `min(base * 2^attempt, max)`.
///
/// Unlike `backoff::ExponentialBackoff` this policy is deterministic (no
/// jitter) and counts attempts, so it can enforce `max_reconnect_attempts`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &RtspConfig) -> Self {
        Self::new(
            config.reconnect_base_delay(),
            config.reconnect_max_delay(),
            config.max_reconnect_attempts,
        )
    }

    /// Reconnect attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, without consuming it.
    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.attempts)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// True once `max_attempts` retries have been spent (never for 0).
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }
}

impl Backoff for ReconnectPolicy {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.current_delay();
        self.attempts += 1;
        Some(delay)
    }
}

/// How a streaming session ended.
enum SessionEnd {
    Cancelled,
    OutputClosed,
    Failed(RtspError),
}

/// Drives one camera through the connection state machine.
pub struct StreamConnector {
    config: RtspConfig,
    source: Arc<dyn MediaSource>,
    telemetry: Arc<Telemetry>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<RwLock<StreamStats>>,
    fault_tx: mpsc::Sender<SessionFault>,
    fault_rx: mpsc::Receiver<SessionFault>,
}

impl StreamConnector {
    /// Create a new connector for the given configuration and transport.
    pub fn new(config: RtspConfig, source: Arc<dyn MediaSource>, telemetry: Arc<Telemetry>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (fault_tx, fault_rx) = mpsc::channel(8);

        Self {
            config,
            source,
            telemetry,
            state_tx,
            stats: Arc::new(RwLock::new(StreamStats::default())),
            fault_tx,
            fault_rx,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Channel used by downstream stages to recycle a session.
    pub fn fault_sender(&self) -> mpsc::Sender<SessionFault> {
        self.fault_tx.clone()
    }

    /// Shared handle to stream statistics.
    pub fn stats_handle(&self) -> Arc<RwLock<StreamStats>> {
        self.stats.clone()
    }

    /// Get current stream statistics.
    pub fn stats(&self) -> StreamStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                device_id = %self.config.device_id,
                from = previous.as_str(),
                to = state.as_str(),
                "Connection state changed"
            );
        }
    }

    /// Run the connection state machine until shutdown, until the consumer
    /// goes away, or until the reconnect budget is spent.
    ///
    /// Access units are sent with a blocking send, so a slow consumer stalls
    /// this receive loop instead of growing a buffer.
    pub async fn run(
        mut self,
        output: mpsc::Sender<AccessUnit>,
        shutdown: CancellationToken,
    ) -> Result<(), RtspError> {
        let mut policy = ReconnectPolicy::from_config(&self.config);
        let mut session_id = 0u64;
        let connect_timeout = self.config.connection_timeout();

        info!(
            device_id = %self.config.device_id,
            url = %self.config.url,
            transport = %self.config.transport,
            "Starting RTSP connector"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            session_id += 1;
            let mut session = StreamSession::new(session_id, &self.config, policy.attempts());
            self.set_state(ConnectionState::Connecting);

            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tokio::time::timeout(connect_timeout, self.source.open(&session)) => {
                    result.unwrap_or(Err(RtspError::ConnectTimeout(connect_timeout)))
                }
            };

            let failure = match opened {
                Ok(stream) => {
                    policy.reset();
                    session.state = ConnectionState::Streaming;
                    self.set_state(ConnectionState::Streaming);
                    {
                        let mut stats = self.stats.write();
                        stats.sessions_opened += 1;
                        stats.stream_start = Some(Instant::now());
                    }
                    info!(
                        device_id = %self.config.device_id,
                        url = %self.config.url,
                        session_id = session_id,
                        attempts = session.attempt,
                        "Connected to RTSP stream"
                    );

                    match self
                        .stream_session(session_id, stream, &output, &shutdown)
                        .await
                    {
                        SessionEnd::Cancelled | SessionEnd::OutputClosed => break,
                        SessionEnd::Failed(e) => {
                            self.telemetry.record_reconnect();
                            self.stats.write().reconnect_count += 1;
                            warn!(
                                device_id = %self.config.device_id,
                                session_id = session_id,
                                error = %e,
                                "RTSP session ended"
                            );
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            session.last_error = Some(failure.to_string());
            session.state = ConnectionState::Reconnecting;
            self.stats.write().last_error = session.last_error.clone();
            self.set_state(ConnectionState::Reconnecting);

            match policy.next_backoff() {
                Some(delay) => {
                    warn!(
                        device_id = %self.config.device_id,
                        attempt = policy.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Connection failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    self.set_state(ConnectionState::Terminated);
                    error!(
                        device_id = %self.config.device_id,
                        attempts = policy.attempts(),
                        error = %failure,
                        "Max reconnection attempts exceeded"
                    );
                    return Err(RtspError::MaxReconnectAttemptsExceeded {
                        attempts: policy.attempts(),
                        last_error: failure.to_string(),
                    });
                }
            }
        }

        self.set_state(ConnectionState::Terminated);
        info!(device_id = %self.config.device_id, "RTSP connector stopped");
        Ok(())
    }

    /// Pump access units from an open session until it ends.
    async fn stream_session(
        &mut self,
        session_id: u64,
        mut stream: Box<dyn MediaStream>,
        output: &mpsc::Sender<AccessUnit>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let receive_timeout = self.config.connection_timeout();

        loop {
            let packet = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Cancelled,
                Some(fault) = self.fault_rx.recv() => {
                    if fault.session_id == session_id {
                        return SessionEnd::Failed(RtspError::SessionFault(fault.reason));
                    }
                    debug!(
                        device_id = %self.config.device_id,
                        stale_session = fault.session_id,
                        "Ignoring fault for a previous session"
                    );
                    continue;
                }
                result = tokio::time::timeout(receive_timeout, stream.next_unit()) => {
                    match result {
                        Ok(Ok(Some(packet))) => packet,
                        Ok(Ok(None)) => return SessionEnd::Failed(RtspError::EndOfStream),
                        Ok(Err(e)) => return SessionEnd::Failed(e),
                        Err(_) => return SessionEnd::Failed(RtspError::ReceiveTimeout(receive_timeout)),
                    }
                }
            };

            let now = Instant::now();
            self.telemetry.record_frame_received(packet.data.len());
            {
                let mut s = self.stats.write();
                s.frames_received += 1;
                s.bytes_received += packet.data.len() as u64;
                s.last_frame_at = Some(now);
                if let Some(start) = s.stream_start {
                    let elapsed = start.elapsed().as_secs_f64();
                    if elapsed > 0.0 {
                        s.current_fps = s.frames_received as f64 / elapsed;
                    }
                }
            }

            let unit = AccessUnit {
                data: packet.data,
                pts: packet.pts,
                session_id,
                received_at: now,
            };

            tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Cancelled,
                sent = output.send(unit) => {
                    if sent.is_err() {
                        info!(device_id = %self.config.device_id, "Access unit consumer closed");
                        return SessionEnd::OutputClosed;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PixelFormat;
    use crate::decoder::encode_raw_unit;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub(crate) fn create_test_config() -> RtspConfig {
        RtspConfig {
            url: "rtsp://test:554/stream".to_string(),
            device_id: "test-device".to_string(),
            worker_id: None,
            zone_id: None,
            connection_timeout_secs: 5,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30000,
            transport: TransportMode::Tcp,
            buffer_ms: 100,
        }
    }

    /// What the scripted source does on each `open`.
    pub(crate) enum Script {
        Fail,
        Hang,
        /// Deliver this many packets, then end the stream
        Packets(usize),
        /// Deliver this many packets at the given interval, then end the stream
        Paced(usize, Duration),
        /// Deliver packets at the given interval until dropped
        Endless(Duration),
    }

    pub(crate) struct ScriptedSource {
        script: Mutex<VecDeque<Script>>,
        pub(crate) opens: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                opens: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn open_count(&self) -> usize {
            self.opens.lock().len()
        }

        pub(crate) fn delays_ms(&self) -> Vec<u64> {
            let opens = self.opens.lock();
            opens
                .windows(2)
                .map(|w| ((w[1] - w[0]).as_secs_f64() * 1000.0).round() as u64)
                .collect()
        }
    }

    struct ScriptedStream {
        remaining: Option<usize>,
        interval: Duration,
        sent: u64,
    }

    #[async_trait]
    impl MediaStream for ScriptedStream {
        async fn next_unit(&mut self) -> Result<Option<MediaPacket>, RtspError> {
            if self.remaining == Some(0) {
                return Ok(None);
            }
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            if let Some(n) = self.remaining.as_mut() {
                *n -= 1;
            }
            let fill = self.sent as u8;
            self.sent += 1;
            Ok(Some(MediaPacket {
                data: encode_raw_unit(4, 2, PixelFormat::Rgb24, &[fill; 24]),
                pts: Some(self.sent),
            }))
        }
    }

    #[async_trait]
    impl MediaSource for ScriptedSource {
        async fn open(&self, _session: &StreamSession) -> Result<Box<dyn MediaStream>, RtspError> {
            self.opens.lock().push(tokio::time::Instant::now());
            let next = self.script.lock().pop_front().unwrap_or(Script::Fail);
            match next {
                Script::Fail => Err(RtspError::ConnectionFailed("connection refused".into())),
                Script::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Script::Packets(n) => Ok(Box::new(ScriptedStream {
                    remaining: Some(n),
                    interval: Duration::ZERO,
                    sent: 0,
                })),
                Script::Paced(n, interval) => Ok(Box::new(ScriptedStream {
                    remaining: Some(n),
                    interval,
                    sent: 0,
                })),
                Script::Endless(interval) => Ok(Box::new(ScriptedStream {
                    remaining: None,
                    interval,
                    sent: 0,
                })),
            }
        }
    }

    #[test]
    fn test_backoff_sequence_capped() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(1000), Duration::from_millis(30000), 0);
        let delays: Vec<u64> = (0..6)
            .map(|_| policy.next_backoff().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
        assert_eq!(policy.attempts(), 6);
    }

    #[test]
    fn test_backoff_non_decreasing_and_resets() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(250), Duration::from_millis(5000), 0);
        let mut last = Duration::ZERO;
        for _ in 0..64 {
            let delay = policy.next_backoff().unwrap();
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(5000));
            last = delay;
        }

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_backoff_exhaustion() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(1000), 2);
        assert!(policy.next_backoff().is_some());
        assert!(policy.next_backoff().is_some());
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_backoff(), None);
    }

    #[test]
    fn test_connection_state_default() {
        let source = ScriptedSource::new(vec![]);
        let connector =
            StreamConnector::new(create_test_config(), source, Arc::new(Telemetry::new()));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert_eq!(connector.stats().reconnect_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_six_failures_follow_backoff_schedule() {
        let mut config = create_test_config();
        config.max_reconnect_attempts = 6;
        let source = ScriptedSource::new(vec![]);
        let connector =
            StreamConnector::new(config, source.clone(), Arc::new(Telemetry::new()));
        let (tx, _rx) = mpsc::channel(8);

        let result = connector.run(tx, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(RtspError::MaxReconnectAttemptsExceeded { attempts: 6, .. })
        ));
        assert_eq!(source.open_count(), 7);
        assert_eq!(
            source.delays_ms(),
            vec![1000, 2000, 4000, 8000, 16000, 30000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_terminates_once() {
        let source = ScriptedSource::new(vec![]);
        let telemetry = Arc::new(Telemetry::new());
        let connector =
            StreamConnector::new(create_test_config(), source.clone(), telemetry.clone());
        let mut states = connector.state_receiver();
        let (tx, _rx) = mpsc::channel(8);

        let result = connector.run(tx, CancellationToken::new()).await;

        // Initial attempt plus three retries.
        assert_eq!(source.open_count(), 4);
        assert!(matches!(
            result,
            Err(RtspError::MaxReconnectAttemptsExceeded { attempts: 3, .. })
        ));
        assert_eq!(*states.borrow_and_update(), ConnectionState::Terminated);
        assert_eq!(telemetry.snapshot().rtsp_reconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_session_resets_backoff() {
        let mut config = create_test_config();
        config.max_reconnect_attempts = 2;
        let source = ScriptedSource::new(vec![
            Script::Fail,
            Script::Packets(3),
            Script::Fail,
            Script::Fail,
        ]);
        let telemetry = Arc::new(Telemetry::new());
        let connector = StreamConnector::new(config, source.clone(), telemetry.clone());
        let (tx, mut rx) = mpsc::channel(16);

        let result = connector.run(tx, CancellationToken::new()).await;
        assert!(result.is_err());

        assert_eq!(source.open_count(), 4);
        assert_eq!(source.delays_ms(), vec![1000, 1000, 2000]);

        let snap = telemetry.snapshot();
        assert_eq!(snap.rtsp_reconnects, 1);
        assert_eq!(snap.frames_received, 3);

        let mut sessions = Vec::new();
        while let Ok(unit) = rx.try_recv() {
            sessions.push(unit.session_id);
        }
        assert_eq!(sessions, vec![2, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let mut config = create_test_config();
        config.max_reconnect_attempts = 1;
        let source = ScriptedSource::new(vec![Script::Hang, Script::Hang]);
        let connector =
            StreamConnector::new(config, source.clone(), Arc::new(Telemetry::new()));
        let (tx, _rx) = mpsc::channel(8);

        let started = tokio::time::Instant::now();
        let result = connector.run(tx, CancellationToken::new()).await;

        match result {
            Err(RtspError::MaxReconnectAttemptsExceeded { last_error, .. }) => {
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(source.open_count(), 2);
        // Two 5s connect timeouts and one 1s backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(11));
        assert!(elapsed < Duration::from_millis(11_050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let mut config = create_test_config();
        config.max_reconnect_attempts = 0;
        config.reconnect_base_delay_ms = 60_000;
        config.reconnect_max_delay_ms = 60_000;
        let source = ScriptedSource::new(vec![]);
        let connector =
            StreamConnector::new(config, source.clone(), Arc::new(Telemetry::new()));
        let states = connector.state_receiver();
        let shutdown = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        let handle = tokio::spawn(connector.run(tx, shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*states.borrow(), ConnectionState::Reconnecting);

        shutdown.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(*states.borrow(), ConnectionState::Terminated);
        assert_eq!(source.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_fault_triggers_reconnect() {
        let mut config = create_test_config();
        config.max_reconnect_attempts = 1;
        let source = ScriptedSource::new(vec![Script::Endless(Duration::from_millis(10))]);
        let telemetry = Arc::new(Telemetry::new());
        let connector = StreamConnector::new(config, source.clone(), telemetry.clone());
        let faults = connector.fault_sender();
        let (tx, mut rx) = mpsc::channel(64);

        let handle = tokio::spawn(connector.run(tx, CancellationToken::new()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session_id, 1);
        faults
            .send(SessionFault {
                session_id: 1,
                reason: "decoder gave up".into(),
            })
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(source.open_count(), 2);
        assert_eq!(telemetry.snapshot().rtsp_reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_output_stops_connector() {
        let source = ScriptedSource::new(vec![Script::Endless(Duration::from_millis(5))]);
        let connector = StreamConnector::new(
            create_test_config(),
            source.clone(),
            Arc::new(Telemetry::new()),
        );
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = connector.run(tx, CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(source.open_count(), 1);
    }
}
