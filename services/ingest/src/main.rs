//! RTSP Ingest Service for Nier Factory Floor Analytics
//!
//! This service captures video streams from worker-worn camera glasses via RTSP,
//! normalizes the frames, and streams them in batches to the inference service.
//!
//! # Architecture
//!
//! ```text
//! RTSP Stream -> StreamConnector -> FrameProcessor -> DispatchQueue -> BatchingClient -> Inference
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with INGEST_)
//!
//! A `stub://name/WxH@FPS` URL runs the whole pipeline against a synthetic
//! source, which is handy without a camera at hand.

use nier_ingest::config::{IngestConfig, LoggingConfig};
use nier_ingest::{
    InferenceClient, InferenceGrpcClient, IngestPipeline, PipelineError, PipelineMonitor, Telemetry,
};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state and shared resources.
struct AppState {
    config: IngestConfig,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl AppState {
    fn new(config: IngestConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            telemetry: Arc::new(Telemetry::new()),
        }
    }

    fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "nier-ingest",
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.rtsp.device_id,
        "Starting RTSP ingest service"
    );

    // Validate configuration
    config.validate()?;

    if config.health.enable_metrics {
        init_metrics(config.health.port)?;
    }

    let state = Arc::new(AppState::new(config));

    tokio::spawn({
        let state = state.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Initiating graceful shutdown...");
                    state.shutdown();
                }
                _ = state.shutdown.cancelled() => {}
            }
        }
    });

    match run_pipeline(state).await {
        Ok(()) => {
            info!("Ingest service completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Ingest service failed");
            Err(e)
        }
    }
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> anyhow::Result<IngestConfig> {
    let config = IngestConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        IngestConfig::from_env()
    })?;

    Ok(config)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_level(&config.level);

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("nier_ingest={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("tonic=info".parse()?)
        .add_directive("h2=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let location = config.include_location;

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(location)
                    .with_line_number(location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(location)
                    .with_line_number(location),
            )
            .init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run the ingest pipeline until it stops or shutdown is requested.
async fn run_pipeline(state: Arc<AppState>) -> anyhow::Result<()> {
    let config = state.config.clone();

    let grpc_client = Arc::new(InferenceGrpcClient::new(
        config.grpc.clone(),
        config.rtsp.device_id.clone(),
    ));

    info!(endpoint = %config.grpc.inference_endpoint, "Connecting to inference service...");
    tokio::select! {
        result = grpc_client.connect_with_retry() => {
            result.context("Failed to connect to inference service")?;
        }
        _ = state.shutdown.cancelled() => {
            info!("Shutdown requested before the inference service was reachable");
            return Ok(());
        }
    }

    let pipeline =
        IngestPipeline::from_config(config.clone(), grpc_client.clone(), state.telemetry.clone())?;
    let running = pipeline.start(state.shutdown.clone());
    let monitor = running.monitor();

    let health_handle = tokio::spawn(run_health_monitor(
        state.clone(),
        grpc_client.clone(),
        monitor.clone(),
        Duration::from_secs(config.health.interval_secs),
    ));

    let result = running.wait().await;

    // Stop the health monitor with everything else
    state.shutdown();
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health monitor task failed");
    }

    grpc_client.disconnect().await;
    log_final_stats(&monitor);

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(PipelineError::Rtsp(e)) => Err(anyhow::Error::new(e).context("RTSP stream terminated")),
        Err(e) => Err(e.into()),
    }
}

/// Periodically probe the inference service and log pipeline stats.
async fn run_health_monitor(
    state: Arc<AppState>,
    grpc_client: Arc<InferenceGrpcClient>,
    monitor: PipelineMonitor,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    while state.is_running() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.shutdown.cancelled() => break,
        }

        match grpc_client.health_check(&state.config.rtsp.device_id).await {
            Ok(health) if !health.is_serving() => {
                warn!(status = ?health, "Inference service reported unhealthy");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Health check failed");
            }
        }

        let probe = monitor.health();
        let stream = monitor.stream_stats();
        info!(
            state = probe.state().as_str(),
            live = probe.is_live(),
            ready = probe.is_ready(),
            frames_received = stream.frames_received,
            fps = format!("{:.2}", stream.current_fps),
            reconnects = stream.reconnect_count,
            "RTSP stream stats"
        );

        let processor = monitor.processor_stats();
        info!(
            frames_decoded = processor.frames_decoded,
            frames_processed = processor.frames_processed,
            dropped_rate_limit = processor.frames_dropped_rate_limit,
            dropped_backpressure = processor.frames_dropped_backpressure,
            decode_errors = processor.decode_errors,
            avg_processing_us = format!("{:.1}", processor.avg_processing_time_us),
            "Frame processor stats"
        );

        let telemetry = monitor.telemetry();
        info!(
            frames_sent = telemetry.frames_sent,
            frames_accepted = telemetry.frames_accepted,
            frames_rejected = telemetry.frames_rejected,
            batches_failed = telemetry.batches_failed,
            avg_latency_ms = format!("{:.2}", telemetry.avg_submission_latency_ms()),
            "gRPC client stats"
        );
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(monitor: &PipelineMonitor) {
    info!("=== Final Statistics ===");

    let stream = monitor.stream_stats();
    info!(
        frames_received = stream.frames_received,
        bytes_received = stream.bytes_received,
        sessions_opened = stream.sessions_opened,
        reconnect_count = stream.reconnect_count,
        last_error = stream.last_error.as_deref().unwrap_or(""),
        "RTSP final stats"
    );

    let batcher = monitor.batcher_stats();
    info!(
        batches_created = batcher.batches_created,
        flushed_by_size = batcher.flushed_by_size,
        flushed_by_timeout = batcher.flushed_by_timeout,
        flushed_by_drain = batcher.flushed_by_drain,
        discarded_on_shutdown = batcher.frames_discarded_on_shutdown,
        exchanges_aborted = batcher.exchanges_aborted,
        "Batcher final stats"
    );

    let telemetry = monitor.telemetry();
    info!(
        frames_dropped = telemetry.frames_dropped(),
        dropped_rate_limited = telemetry.dropped_rate_limited,
        dropped_backpressure = telemetry.dropped_backpressure,
        dropped_decode_error = telemetry.dropped_decode_error,
        frames_sent = telemetry.frames_sent,
        frames_accepted = telemetry.frames_accepted,
        frames_rejected = telemetry.frames_rejected,
        batches_sent = telemetry.batches_sent,
        avg_latency_ms = format!("{:.2}", telemetry.avg_submission_latency_ms()),
        "gRPC final stats"
    );
}
