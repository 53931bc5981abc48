//! Synthetic camera for `stub://` URLs.
//!
//! Produces uncompressed test pattern frames at a fixed rate so the whole
//! pipeline can run on machines without GStreamer or a camera. The URL shape
//! is `stub://<name>/<width>x<height>@<fps>`; the geometry part is optional.

use crate::config::PixelFormat;
use crate::decoder::encode_raw_unit;
use crate::rtsp_client::{MediaPacket, MediaSource, MediaStream, RtspError, StreamSession};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::debug;

pub const STUB_SCHEME: &str = "stub://";

/// Geometry and rate of the synthetic stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticSpec {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30.0,
        }
    }
}

impl SyntheticSpec {
    /// Parse a `stub://` URL.
    pub fn parse(url: &str) -> Result<Self, RtspError> {
        let rest = url
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| RtspError::UnsupportedUrl(url.to_string()))?;

        let Some((_, geometry)) = rest.split_once('/') else {
            return Ok(Self::default());
        };
        if geometry.is_empty() {
            return Ok(Self::default());
        }

        let invalid = || RtspError::UnsupportedUrl(format!("{}: expected WxH@FPS", url));
        let (size, fps) = match geometry.split_once('@') {
            Some((size, fps)) => (size, fps.parse::<f32>().map_err(|_| invalid())?),
            None => (geometry, Self::default().fps),
        };
        let (w, h) = size.split_once('x').ok_or_else(invalid)?;
        let width = w.parse::<u32>().map_err(|_| invalid())?;
        let height = h.parse::<u32>().map_err(|_| invalid())?;

        if width == 0 || height == 0 || !fps.is_finite() || fps <= 0.0 {
            return Err(invalid());
        }

        Ok(Self { width, height, fps })
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps))
    }
}

/// Test pattern source selected for `stub://` URLs.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    spec: SyntheticSpec,
}

impl SyntheticSource {
    pub fn new(spec: SyntheticSpec) -> Self {
        Self { spec }
    }

    pub fn from_url(url: &str) -> Result<Self, RtspError> {
        SyntheticSpec::parse(url).map(Self::new)
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn open(&self, session: &StreamSession) -> Result<Box<dyn MediaStream>, RtspError> {
        debug!(
            session_id = session.id,
            width = self.spec.width,
            height = self.spec.height,
            fps = self.spec.fps,
            "Opening synthetic stream"
        );

        let mut ticker = interval(self.spec.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(SyntheticStream {
            spec: self.spec,
            origin: Instant::now(),
            ticker,
            index: 0,
        }))
    }
}

struct SyntheticStream {
    spec: SyntheticSpec,
    origin: Instant,
    ticker: Interval,
    index: u64,
}

impl SyntheticStream {
    /// Diagonal gradient that shifts by one pixel per frame.
    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.spec.width as usize, self.spec.height as usize);
        let shift = self.index as usize;
        let mut pixels = Vec::with_capacity(
            PixelFormat::Rgb24
                .frame_size(self.spec.width, self.spec.height)
                .unwrap_or_default(),
        );
        for y in 0..h {
            for x in 0..w {
                let v = ((x + y + shift) & 0xff) as u8;
                pixels.extend_from_slice(&[v, v.wrapping_add(85), v.wrapping_add(170)]);
            }
        }
        pixels
    }
}

#[async_trait]
impl MediaStream for SyntheticStream {
    async fn next_unit(&mut self) -> Result<Option<MediaPacket>, RtspError> {
        // `Interval::tick` is cancel safe.
        let tick = self.ticker.tick().await;
        let pixels = self.render();
        let pts = tick.duration_since(self.origin).as_nanos() as u64;
        self.index += 1;

        Ok(Some(MediaPacket {
            data: encode_raw_unit(self.spec.width, self.spec.height, PixelFormat::Rgb24, &pixels),
            pts: Some(pts),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use crate::decoder::{FrameDecoder, RawVideoDecoder};
    use crate::frame::AccessUnit;
    use crate::rtsp_client::ConnectionState;

    fn session() -> StreamSession {
        StreamSession {
            id: 1,
            url: "stub://cam/8x4@50".to_string(),
            transport: TransportMode::Tcp,
            connection_timeout: Duration::from_secs(1),
            buffer_ms: 0,
            state: ConnectionState::Connecting,
            attempt: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_parse_full_url() {
        let spec = SyntheticSpec::parse("stub://synthetic/640x480@15").unwrap();
        assert_eq!(spec.width, 640);
        assert_eq!(spec.height, 480);
        assert_eq!(spec.fps, 15.0);
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(
            SyntheticSpec::parse("stub://synthetic").unwrap(),
            SyntheticSpec::default()
        );
        let spec = SyntheticSpec::parse("stub://synthetic/320x240").unwrap();
        assert_eq!((spec.width, spec.height, spec.fps), (320, 240, 30.0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SyntheticSpec::parse("rtsp://camera/stream").is_err());
        assert!(SyntheticSpec::parse("stub://x/640by480").is_err());
        assert!(SyntheticSpec::parse("stub://x/0x480@30").is_err());
        assert!(SyntheticSpec::parse("stub://x/640x480@0").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_is_paced_and_decodable() {
        let source = SyntheticSource::from_url("stub://cam/8x4@50").unwrap();
        let mut stream = source.open(&session()).await.unwrap();

        let start = Instant::now();
        let mut decoder = RawVideoDecoder;
        for _ in 0..5 {
            let packet = stream.next_unit().await.unwrap().unwrap();
            let unit = AccessUnit {
                data: packet.data,
                pts: packet.pts,
                session_id: 1,
                received_at: std::time::Instant::now(),
            };
            assert!(unit.pts.is_some());
            let images = decoder.decode(&unit).unwrap();
            assert_eq!(images[0].width, 8);
            assert_eq!(images[0].height, 4);
        }

        // First tick is immediate, then one every 20ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(79), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(81), "{:?}", elapsed);
    }
}
