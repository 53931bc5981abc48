//! gRPC client for the inference service.
//!
//! [`InferenceClient`] is the seam the batch submitter talks to. The tonic
//! implementation owns one multiplexed channel; concurrent exchanges share it
//! and are bounded by the submitter, not here.

use crate::config::{GrpcConfig, PixelFormat};
use crate::frame::{Batch, NormalizedFrame};
use crate::proto::inference_service_client::InferenceServiceClient;
use crate::proto::{
    HealthCheckRequest, HealthStatus, ImageFormat, InferBatchRequest, InferRequest,
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use parking_lot::RwLock;
use std::time::Duration;
use thiserror::Error;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

/// Errors from a single exchange with the inference service.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Not connected to inference service")]
    NotConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Inference service returned {code:?}: {message}")]
    Status { code: Code, message: String },

    #[error("All {frames} frames rejected by inference service")]
    Rejected { frames: usize },
}

impl SubmitError {
    /// Transient failures that may succeed on a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Timeout(_) | SubmitError::Connect(_) => true,
            SubmitError::Status { code, .. } => matches!(
                code,
                Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
            ),
            _ => false,
        }
    }
}

impl From<tonic::Status> for SubmitError {
    fn from(status: tonic::Status) -> Self {
        SubmitError::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// Server acknowledgement for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchAck {
    pub accepted: usize,
    pub rejected: usize,
    pub server_time_ms: f32,
}

/// Health as reported by the inference service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ServiceHealth {
    pub fn is_serving(self) -> bool {
        !matches!(self, ServiceHealth::Unhealthy)
    }
}

/// Transport-agnostic inference endpoint.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// One request/response exchange carrying every frame of `batch`.
    async fn submit_batch(&self, batch: &Batch) -> Result<BatchAck, SubmitError>;

    async fn health_check(&self, device_id: &str) -> Result<ServiceHealth, SubmitError>;
}

fn image_format(format: PixelFormat) -> ImageFormat {
    match format {
        PixelFormat::Rgb24 => ImageFormat::RawRgb,
        PixelFormat::Bgr24 => ImageFormat::RawBgr,
        PixelFormat::Gray8 => ImageFormat::RawGray,
        PixelFormat::Rgba32 => ImageFormat::Unspecified,
    }
}

fn infer_request(frame: &NormalizedFrame) -> InferRequest {
    InferRequest {
        frame_id: frame.frame_id.clone(),
        image_data: frame.data.clone(),
        format: image_format(frame.pixel_format) as i32,
        timestamp_ms: frame.timestamp_ms(),
        worker_id: frame.source.worker_id.clone().unwrap_or_default(),
        camera_id: frame.source.device_id.clone(),
        width: frame.width,
        height: frame.height,
        zone_id: frame.source.zone_id.clone().unwrap_or_default(),
        sequence: frame.sequence,
    }
}

/// Build the wire request for a batch. Frame payloads are shared, not copied.
pub fn batch_request(batch: &Batch, device_id: &str) -> InferBatchRequest {
    InferBatchRequest {
        requests: batch.frames.iter().map(infer_request).collect(),
        batch_id: batch.id,
        device_id: device_id.to_string(),
    }
}

/// Tonic client for `nier.inference.v1.InferenceService`.
pub struct InferenceGrpcClient {
    config: GrpcConfig,
    device_id: String,
    client: RwLock<Option<InferenceServiceClient<Channel>>>,
}

impl InferenceGrpcClient {
    pub fn new(config: GrpcConfig, device_id: impl Into<String>) -> Self {
        Self {
            config,
            device_id: device_id.into(),
            client: RwLock::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    async fn endpoint(&self) -> Result<Endpoint, SubmitError> {
        let mut endpoint = Endpoint::from_shared(self.config.inference_endpoint.clone())
            .map_err(|e| SubmitError::InvalidEndpoint(e.to_string()))?
            .connect_timeout(self.config.connection_timeout())
            .timeout(self.config.request_timeout())
            .tcp_nodelay(true);

        if self.config.use_tls {
            let mut tls = ClientTlsConfig::new();
            if let Some(path) = &self.config.ca_cert_path {
                let pem = tokio::fs::read(path)
                    .await
                    .map_err(|e| SubmitError::Tls(format!("{}: {}", path, e)))?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| SubmitError::Tls(e.to_string()))?;
        }

        Ok(endpoint)
    }

    /// Open the channel once.
    pub async fn connect(&self) -> Result<(), SubmitError> {
        let channel = self
            .endpoint()
            .await?
            .connect()
            .await
            .map_err(|e| SubmitError::Connect(e.to_string()))?;

        let mut client = InferenceServiceClient::new(channel);
        if self.config.enable_compression {
            client = client
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip);
        }

        *self.client.write() = Some(client);
        info!(endpoint = %self.config.inference_endpoint, "Connected to inference service");
        Ok(())
    }

    /// Connect with exponential backoff, giving up after a few connection
    /// timeouts worth of attempts. Configuration errors are not retried.
    pub async fn connect_with_retry(&self) -> Result<(), SubmitError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_base_delay())
            .with_max_interval(self.config.connection_timeout())
            .with_max_elapsed_time(Some(self.config.connection_timeout() * 3))
            .build();

        backoff::future::retry(policy, || async {
            self.connect().await.map_err(|e| {
                if e.is_retryable() {
                    warn!(error = %e, "Inference service unreachable, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    pub async fn disconnect(&self) {
        if self.client.write().take().is_some() {
            info!(endpoint = %self.config.inference_endpoint, "Disconnected from inference service");
        }
    }

    fn client(&self) -> Result<InferenceServiceClient<Channel>, SubmitError> {
        self.client.read().clone().ok_or(SubmitError::NotConnected)
    }
}

#[async_trait]
impl InferenceClient for InferenceGrpcClient {
    async fn submit_batch(&self, batch: &Batch) -> Result<BatchAck, SubmitError> {
        let mut client = self.client()?;
        let request = batch_request(batch, &self.device_id);

        let response = client.infer_batch(request).await?.into_inner();
        let accepted = usize::try_from(response.successful_count).unwrap_or(0);
        let rejected = usize::try_from(response.failed_count).unwrap_or(0);

        debug!(
            batch_id = batch.id,
            frames = batch.len(),
            accepted,
            rejected,
            server_time_ms = response.total_time_ms,
            "Batch acknowledged"
        );

        if accepted == 0 && !batch.is_empty() {
            return Err(SubmitError::Rejected {
                frames: batch.len(),
            });
        }

        Ok(BatchAck {
            accepted,
            rejected,
            server_time_ms: response.total_time_ms,
        })
    }

    async fn health_check(&self, device_id: &str) -> Result<ServiceHealth, SubmitError> {
        let mut client = self.client()?;
        let response = client
            .health_check(HealthCheckRequest {
                device_id: device_id.to_string(),
            })
            .await?
            .into_inner();

        let health = match HealthStatus::try_from(response.status) {
            Ok(HealthStatus::Healthy) => ServiceHealth::Healthy,
            Ok(HealthStatus::Degraded) => ServiceHealth::Degraded,
            _ => ServiceHealth::Unhealthy,
        };

        debug!(
            status = ?health,
            model_loaded = response.model_loaded,
            queue_depth = response.queue_depth,
            "Inference health check"
        );
        Ok(health)
    }
}
