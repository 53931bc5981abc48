//! Nier Ingest - RTSP camera ingest for factory floor analytics
//!
//! Pulls video from worker-worn camera glasses, decodes and normalizes the
//! frames, and streams them in batches to the inference service over gRPC.
//!
//! ```text
//! RTSP -> StreamConnector -> FrameProcessor -> DispatchQueue -> BatchingClient -> Inference
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use nier_ingest::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let telemetry = Arc::new(Telemetry::new());
//!
//!     let client = Arc::new(InferenceGrpcClient::new(
//!         config.grpc.clone(),
//!         config.rtsp.device_id.clone(),
//!     ));
//!     client.connect_with_retry().await?;
//!
//!     let shutdown = CancellationToken::new();
//!     let running = IngestPipeline::from_config(config, client, telemetry)?.start(shutdown);
//!     running.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod config;
pub mod decoder;
pub mod dispatch_queue;
pub mod frame;
pub mod frame_processor;
pub mod grpc_client;
#[cfg(feature = "gstreamer")]
pub mod gst_source;
pub mod pipeline;
pub mod rtsp_client;
pub mod synthetic;
pub mod telemetry;

// Re-export main types
pub use batcher::{BatchAccumulator, BatcherStats, BatchingClient};
pub use config::{
    ConfigValidationError, GrpcConfig, HealthConfig, IngestConfig, LoggingConfig, PixelFormat,
    ProcessingConfig, RtspConfig, TransportMode,
};
pub use decoder::{
    encode_raw_unit, DecodeError, DecoderFactory, FrameDecoder, RawVideoDecoderFactory,
};
pub use dispatch_queue::{dispatch_queue, DispatchReceiver, DispatchSender, EnqueueOutcome, QueueError};
pub use frame::{AccessUnit, Batch, DecodedImage, FlushReason, NormalizedFrame, RawFrame, SourceInfo};
pub use frame_processor::{FrameProcessor, Normalizer, ProcessingError, ProcessorStats, RateGate};
pub use grpc_client::{BatchAck, InferenceClient, InferenceGrpcClient, ServiceHealth, SubmitError};
pub use pipeline::{HealthProbe, IngestPipeline, PipelineError, PipelineMonitor, RunningPipeline};
pub use rtsp_client::{
    ConnectionState, MediaPacket, MediaSource, MediaStream, ReconnectPolicy, RtspError,
    SessionFault, StreamConnector, StreamSession, StreamStats,
};
pub use synthetic::{SyntheticSource, SyntheticSpec};
pub use telemetry::{DropReason, Telemetry, TelemetrySnapshot};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::IngestConfig;
    pub use crate::grpc_client::{InferenceClient, InferenceGrpcClient};
    pub use crate::pipeline::{IngestPipeline, PipelineMonitor, RunningPipeline};
    pub use crate::telemetry::Telemetry;
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}

/// Generated `nier.inference.v1` messages and client.
pub mod proto {
    include!("nier.inference.v1.rs");
}
