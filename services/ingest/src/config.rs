//! Service configuration.
//!
//! Every section falls back to its `Default` impl field by field, so a config
//! file only has to name what differs. Required values (camera URL, device id,
//! inference endpoint) default to empty and are reported by [`IngestConfig::validate`].

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

const ENV_PREFIX: &str = "INGEST";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub rtsp: RtspConfig,
    pub processing: ProcessingConfig,
    pub grpc: GrpcConfig,
    pub logging: LoggingConfig,
    pub health: HealthConfig,
}

/// Network delivery used for the RTP media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TransportMode {
    /// RTP interleaved over the RTSP TCP connection (reliable, ordered)
    #[default]
    #[serde(rename = "tcp")]
    Tcp,

    /// RTP over unicast UDP (unreliable)
    #[serde(rename = "udp")]
    Udp,

    /// RTP over multicast UDP (unreliable)
    #[serde(rename = "udp-mcast", alias = "udp_mcast")]
    UdpMulticast,
}

impl TransportMode {
    /// Whether the transport guarantees ordered, reliable delivery.
    pub fn is_stream_oriented(self) -> bool {
        matches!(self, TransportMode::Tcp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Tcp => "tcp",
            TransportMode::Udp => "udp",
            TransportMode::UdpMulticast => "udp-mcast",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB
    #[default]
    #[serde(rename = "RGB", alias = "RGB24", alias = "rgb")]
    Rgb24,

    /// Packed 8-bit BGR
    #[serde(rename = "BGR", alias = "BGR24", alias = "bgr")]
    Bgr24,

    /// Packed 8-bit RGBA, only produced by decoders
    #[serde(rename = "RGBA", alias = "rgba")]
    Rgba32,

    /// Single channel 8-bit luma
    #[serde(rename = "GRAY", alias = "GRAY8", alias = "gray")]
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel for the packed layout.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    /// Size in bytes of a tightly packed frame with the given dimensions,
    /// or `None` when it does not fit in `usize`.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(self.bytes_per_pixel())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgr24 => "BGR",
            PixelFormat::Rgba32 => "RGBA",
            PixelFormat::Gray8 => "GRAY",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera connection and reconnect behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// `rtsp://`, `rtsps://` or `stub://name/WxH@FPS`
    pub url: String,
    /// Stamped into every frame id
    pub device_id: String,
    pub worker_id: Option<String>,
    pub zone_id: Option<String>,
    /// Bound on connecting, and on silence from an open session
    pub connection_timeout_secs: u64,
    /// Failed attempts in a row before giving up, 0 retries forever
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub transport: TransportMode,
    /// rtspsrc jitterbuffer latency
    pub buffer_ms: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            device_id: String::new(),
            worker_id: None,
            zone_id: None,
            connection_timeout_secs: 10,
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            transport: TransportMode::Tcp,
            buffer_ms: 200,
        }
    }
}

/// Decode, decimation and normalization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub target_width: u32,
    pub target_height: u32,
    /// Upper bound on emitted frames per second
    pub target_fps: f32,
    /// Layout of the normalized frames sent for inference
    pub pixel_format: PixelFormat,
    /// Slots in the dispatch queue in front of the batcher
    pub queue_size: usize,
    /// Normalizer threads
    pub num_workers: usize,
    /// Drop new frames on a full dispatch queue instead of waiting for room
    pub drop_on_backpressure: bool,
    /// Undecodable units in a row that force a new session
    pub max_consecutive_decode_failures: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            target_width: 640,
            target_height: 480,
            target_fps: 10.0,
            pixel_format: PixelFormat::Rgb24,
            queue_size: 100,
            num_workers: 2,
            drop_on_backpressure: true,
            max_consecutive_decode_failures: 30,
        }
    }
}

/// Inference service connection and batch submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub inference_endpoint: String,
    pub request_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    /// Batches allowed in flight at once
    pub max_concurrent_requests: usize,
    pub use_tls: bool,
    /// PEM bundle, required when `use_tls` is set
    pub ca_cert_path: Option<String>,
    /// gzip request and response bodies
    pub enable_compression: bool,
    pub batch_size: usize,
    /// Longest a partial batch waits before it is sent anyway
    pub batch_timeout_ms: u64,
    /// Extra attempts for a failed batch, 0 keeps delivery at-most-once
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// How long in-flight batches may run on after shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            inference_endpoint: String::new(),
            request_timeout_secs: 30,
            connection_timeout_secs: 10,
            max_concurrent_requests: 10,
            use_tls: false,
            ca_cert_path: None,
            enable_compression: false,
            batch_size: 1,
            batch_timeout_ms: 100,
            max_retries: 0,
            retry_base_delay_ms: 100,
            shutdown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// json or pretty
    pub format: String,
    /// Add file and line to each event
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            include_location: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between inference health probes and stats lines
    pub interval_secs: u64,
    /// Prometheus scrape port
    pub port: u16,
    pub enable_metrics: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            port: 8080,
            enable_metrics: false,
        }
    }
}

impl IngestConfig {
    /// Layered load: `config/default`, then `config/$RUN_MODE` (both
    /// optional, any format the `config` crate reads), then `INGEST_*`
    /// variables with `__` between section and key, e.g. `INGEST_RTSP__URL`.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(env_source())
            .build()?
            .try_deserialize()
    }

    /// Same as [`IngestConfig::load`] without the files.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(env_source())
            .build()?
            .try_deserialize()
    }

    /// Check cross-field constraints. Stops at the first problem found.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.rtsp.validate()?;
        self.processing.validate()?;
        self.grpc.validate()?;
        ensure(
            self.health.interval_secs > 0,
            "health.interval_secs",
            "must be positive",
        )
    }
}

/// `INGEST_` prefix, `__` between nested keys.
fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn required(value: &str, field: &str) -> Result<(), ConfigValidationError> {
    if value.is_empty() {
        return Err(ConfigValidationError::MissingField(field.to_string()));
    }
    Ok(())
}

fn ensure(ok: bool, field: &str, message: &str) -> Result<(), ConfigValidationError> {
    if ok {
        return Ok(());
    }
    Err(ConfigValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    })
}

const URL_SCHEMES: [&str; 3] = ["rtsp://", "rtsps://", "stub://"];

impl RtspConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        required(&self.url, "rtsp.url")?;
        ensure(
            URL_SCHEMES.iter().any(|scheme| self.url.starts_with(scheme)),
            "rtsp.url",
            "expected an rtsp://, rtsps:// or stub:// URL",
        )?;
        required(&self.device_id, "rtsp.device_id")?;
        ensure(
            self.connection_timeout_secs > 0,
            "rtsp.connection_timeout_secs",
            "must be positive",
        )?;
        ensure(
            self.reconnect_base_delay_ms > 0,
            "rtsp.reconnect_base_delay_ms",
            "must be positive",
        )?;
        ensure(
            self.reconnect_max_delay_ms >= self.reconnect_base_delay_ms,
            "rtsp.reconnect_max_delay_ms",
            "must be at least reconnect_base_delay_ms",
        )
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// First reconnect delay; later ones double up to [`Self::reconnect_max_delay`].
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl ProcessingConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        ensure(
            self.target_width > 0 && self.target_height > 0,
            "processing.target_width/height",
            "both dimensions must be positive",
        )?;
        ensure(
            self.target_fps.is_finite() && self.target_fps > 0.0,
            "processing.target_fps",
            "must be a positive number",
        )?;
        ensure(
            self.pixel_format != PixelFormat::Rgba32,
            "processing.pixel_format",
            "output must be RGB, BGR or GRAY",
        )?;
        ensure(self.queue_size > 0, "processing.queue_size", "must be positive")?;
        ensure(self.num_workers > 0, "processing.num_workers", "must be positive")?;
        ensure(
            self.max_consecutive_decode_failures > 0,
            "processing.max_consecutive_decode_failures",
            "must be positive",
        )
    }

    /// Minimum spacing between two emitted frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos((1_000_000_000.0 / f64::from(self.target_fps)).round() as u64)
    }
}

impl GrpcConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        required(&self.inference_endpoint, "grpc.inference_endpoint")?;
        ensure(
            self.request_timeout_secs > 0,
            "grpc.request_timeout_secs",
            "must be positive",
        )?;
        ensure(
            self.max_concurrent_requests > 0,
            "grpc.max_concurrent_requests",
            "must be positive",
        )?;
        ensure(self.batch_size > 0, "grpc.batch_size", "must be positive")?;
        ensure(
            self.batch_timeout_ms > 0,
            "grpc.batch_timeout_ms",
            "must be positive",
        )?;
        if self.use_tls {
            required(
                self.ca_cert_path.as_deref().unwrap_or_default(),
                "grpc.ca_cert_path",
            )?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("{0} is required")]
    MissingField(String),

    #[error("{field}: {message}")]
    InvalidValue { field: String, message: String },
}
