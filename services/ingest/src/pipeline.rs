//! End-to-end wiring: connector, processor, dispatch queue and submitter.
//!
//! ```text
//! MediaSource -> StreamConnector -> FrameProcessor -> DispatchQueue -> BatchingClient
//!                      ^                  |
//!                      +-- SessionFault --+
//! ```
//!
//! Stages are linked by bounded channels and stop in upstream order: when the
//! connector ends, the processor drains and closes the dispatch queue, then
//! the submitter drains it. A shared [`CancellationToken`] stops all of them
//! at once.

use crate::batcher::{BatcherStats, BatchingClient};
use crate::config::{ConfigValidationError, IngestConfig};
use crate::decoder::{DecodeError, DecoderFactory, RawVideoDecoderFactory};
use crate::dispatch_queue::dispatch_queue;
use crate::frame::SourceInfo;
use crate::frame_processor::{FrameProcessor, ProcessingError, ProcessorStats};
use crate::grpc_client::InferenceClient;
use crate::rtsp_client::{ConnectionState, MediaSource, RtspError, StreamConnector, StreamStats};
use crate::synthetic::{SyntheticSource, STUB_SCHEME};
use crate::telemetry::{Telemetry, TelemetrySnapshot};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Access units buffered between the connector and the processor.
const ACCESS_UNIT_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Stream failed: {0}")]
    Rtsp(#[from] RtspError),

    #[error("Frame processing failed: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Decoder unavailable: {0}")]
    Decoder(#[from] DecodeError),

    #[error("Pipeline task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Pick the media source for the configured URL.
pub fn media_source_for(config: &IngestConfig) -> Result<Arc<dyn MediaSource>, PipelineError> {
    let url = &config.rtsp.url;
    if url.starts_with(STUB_SCHEME) {
        return Ok(Arc::new(SyntheticSource::from_url(url)?));
    }

    #[cfg(feature = "gstreamer")]
    {
        Ok(Arc::new(crate::gst_source::GstRtspSource::new(
            config.rtsp.device_id.clone(),
        )?))
    }

    #[cfg(not(feature = "gstreamer"))]
    {
        Err(RtspError::UnsupportedUrl(format!(
            "{} (built without the `gstreamer` feature)",
            url
        ))
        .into())
    }
}

/// Pick the decoder matching [`media_source_for`].
pub fn decoder_factory_for(config: &IngestConfig) -> Result<Arc<dyn DecoderFactory>, PipelineError> {
    if config.rtsp.url.starts_with(STUB_SCHEME) {
        return Ok(Arc::new(RawVideoDecoderFactory));
    }

    #[cfg(feature = "gstreamer")]
    {
        Ok(Arc::new(crate::gst_source::GstH264DecoderFactory::new()?))
    }

    #[cfg(not(feature = "gstreamer"))]
    {
        Err(DecodeError::Unsupported("H.264 requires the `gstreamer` feature".to_string()).into())
    }
}

/// Liveness and readiness derived from the connector state.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    state: watch::Receiver<ConnectionState>,
}

impl HealthProbe {
    pub fn new(state: watch::Receiver<ConnectionState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// False only once the connector has given up or stopped.
    pub fn is_live(&self) -> bool {
        self.state() != ConnectionState::Terminated
    }

    /// True while frames are flowing.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }
}

/// Fully assembled but not yet started pipeline.
pub struct IngestPipeline {
    config: IngestConfig,
    source: Arc<dyn MediaSource>,
    decoders: Arc<dyn DecoderFactory>,
    client: Arc<dyn InferenceClient>,
    telemetry: Arc<Telemetry>,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn MediaSource>,
        decoders: Arc<dyn DecoderFactory>,
        client: Arc<dyn InferenceClient>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            source,
            decoders,
            client,
            telemetry,
        }
    }

    /// Validate the configuration and select backends from the stream URL.
    pub fn from_config(
        config: IngestConfig,
        client: Arc<dyn InferenceClient>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let source = media_source_for(&config)?;
        let decoders = decoder_factory_for(&config)?;
        Ok(Self::new(config, source, decoders, client, telemetry))
    }

    /// Spawn every stage.
    pub fn start(self, shutdown: CancellationToken) -> RunningPipeline {
        let IngestPipeline {
            config,
            source,
            decoders,
            client,
            telemetry,
        } = self;

        let source_info = SourceInfo {
            device_id: config.rtsp.device_id.clone(),
            worker_id: config.rtsp.worker_id.clone(),
            zone_id: config.rtsp.zone_id.clone(),
        };

        let connector = StreamConnector::new(config.rtsp.clone(), source, telemetry.clone());
        let health = HealthProbe::new(connector.state_receiver());
        let stream_stats = connector.stats_handle();

        let processor = FrameProcessor::new(
            config.processing.clone(),
            source_info,
            decoders,
            telemetry.clone(),
        )
        .with_fault_sender(connector.fault_sender());
        let processor_stats = processor.stats_handle();

        let submitter = BatchingClient::new(client, config.grpc.clone(), telemetry.clone());
        let batcher_stats = submitter.stats_handle();

        let (unit_tx, unit_rx) = mpsc::channel(ACCESS_UNIT_BUFFER);
        let (dispatch_tx, dispatch_rx) = dispatch_queue(
            config.processing.queue_size,
            config.processing.drop_on_backpressure,
            telemetry.clone(),
        );

        info!(
            device_id = %config.rtsp.device_id,
            url = %config.rtsp.url,
            endpoint = %config.grpc.inference_endpoint,
            "Starting ingest pipeline"
        );

        let connector_task = tokio::spawn(connector.run(unit_tx, shutdown.clone()));
        let processor_task = tokio::spawn(processor.run(unit_rx, dispatch_tx, shutdown.clone()));
        let submitter_task = tokio::spawn(submitter.run(dispatch_rx, shutdown.clone()));

        RunningPipeline {
            monitor: PipelineMonitor {
                health,
                stream_stats,
                processor_stats,
                batcher_stats,
                telemetry,
            },
            shutdown,
            connector_task,
            processor_task,
            submitter_task,
        }
    }
}

/// Cloneable read-only view of a running pipeline.
#[derive(Clone)]
pub struct PipelineMonitor {
    health: HealthProbe,
    stream_stats: Arc<RwLock<StreamStats>>,
    processor_stats: Arc<RwLock<ProcessorStats>>,
    batcher_stats: Arc<RwLock<BatcherStats>>,
    telemetry: Arc<Telemetry>,
}

impl PipelineMonitor {
    pub fn health(&self) -> &HealthProbe {
        &self.health
    }

    pub fn stream_stats(&self) -> StreamStats {
        self.stream_stats.read().clone()
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor_stats.read().clone()
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.batcher_stats.read().clone()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }
}

/// Handles to a started pipeline.
pub struct RunningPipeline {
    monitor: PipelineMonitor,
    shutdown: CancellationToken,
    connector_task: JoinHandle<Result<(), RtspError>>,
    processor_task: JoinHandle<Result<(), ProcessingError>>,
    submitter_task: JoinHandle<()>,
}

impl RunningPipeline {
    pub fn monitor(&self) -> PipelineMonitor {
        self.monitor.clone()
    }

    pub fn health(&self) -> HealthProbe {
        self.monitor.health.clone()
    }

    /// Request a stop; [`RunningPipeline::wait`] returns once stages exit.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every stage. The first stage error wins; a terminated
    /// connector is reported even though downstream stages drained cleanly.
    pub async fn wait(self) -> Result<(), PipelineError> {
        let connector = self.connector_task.await;
        if let Ok(Err(e)) = &connector {
            error!(error = %e, "RTSP connector terminated");
        }
        let processor = self.processor_task.await;
        if matches!(processor, Ok(Err(_))) {
            // Nothing downstream can make progress without the processor.
            self.shutdown.cancel();
        }
        let submitter = self.submitter_task.await;

        connector??;
        processor??;
        submitter?;
        info!("Ingest pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::tests::RecordingClient;
    use crate::config::tests::create_test_config;
    use crate::rtsp_client::tests::{Script, ScriptedSource};
    use std::time::Duration;

    fn pipeline_config() -> IngestConfig {
        let mut config = create_test_config();
        config.rtsp.max_reconnect_attempts = 1;
        config.rtsp.reconnect_base_delay_ms = 10;
        config.processing.target_fps = 1000.0;
        config.processing.target_width = 4;
        config.processing.target_height = 2;
        config.processing.drop_on_backpressure = false;
        config.grpc.batch_size = 4;
        config.grpc.max_concurrent_requests = 1;
        config
    }

    #[test]
    fn test_health_probe_states() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let probe = HealthProbe::new(rx);
        assert!(probe.is_live());
        assert!(!probe.is_ready());

        tx.send_replace(ConnectionState::Streaming);
        assert!(probe.is_ready());

        tx.send_replace(ConnectionState::Reconnecting);
        assert!(probe.is_live());
        assert!(!probe.is_ready());

        tx.send_replace(ConnectionState::Terminated);
        assert!(!probe.is_live());
    }

    #[test]
    fn test_stub_url_selects_synthetic_backends() {
        let mut config = create_test_config();
        config.rtsp.url = "stub://synthetic/64x48@10".to_string();
        assert!(media_source_for(&config).is_ok());
        assert_eq!(decoder_factory_for(&config).unwrap().name(), "raw");
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn test_rtsp_url_requires_gstreamer() {
        let config = create_test_config();
        assert!(matches!(
            media_source_for(&config),
            Err(PipelineError::Rtsp(RtspError::UnsupportedUrl(_)))
        ));
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = create_test_config();
        config.grpc.batch_size = 0;
        let result = IngestPipeline::from_config(
            config,
            Arc::new(RecordingClient::new(Duration::ZERO)),
            Arc::new(Telemetry::new()),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_stop_pipeline() {
        let config = pipeline_config();
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::ZERO));
        let source = ScriptedSource::new(vec![
            Script::Paced(6, Duration::from_millis(5)),
            Script::Fail,
        ]);

        let running = IngestPipeline::new(
            config,
            source,
            Arc::new(RawVideoDecoderFactory),
            client.clone(),
            telemetry.clone(),
        )
        .start(CancellationToken::new());
        let health = running.health();

        let result = running.wait().await;
        assert!(matches!(
            result,
            Err(PipelineError::Rtsp(RtspError::MaxReconnectAttemptsExceeded { .. }))
        ));
        assert!(!health.is_live());

        let delivered: Vec<u64> = client.sequences().into_iter().flatten().collect();
        assert_eq!(delivered, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(telemetry.snapshot().frames_sent, 6);
    }

    #[tokio::test]
    async fn test_shutdown_stops_streaming_pipeline() {
        let config = pipeline_config();
        let telemetry = Arc::new(Telemetry::new());
        let client = Arc::new(RecordingClient::new(Duration::ZERO));
        let source = ScriptedSource::new(vec![Script::Endless(Duration::from_millis(5))]);

        let shutdown = CancellationToken::new();
        let running = IngestPipeline::new(
            config,
            source,
            Arc::new(RawVideoDecoderFactory),
            client.clone(),
            telemetry.clone(),
        )
        .start(shutdown.clone());
        let health = running.health();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(health.is_ready());

        running.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .expect("pipeline did not stop")
            .unwrap();
        assert!(telemetry.snapshot().frames_received > 0);
    }
}
