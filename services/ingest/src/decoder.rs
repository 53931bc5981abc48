//! Video decoding behind a codec-agnostic interface.
//!
//! The pipeline only needs "access unit in, zero or more pictures out". Each
//! decode context is owned by exactly one stage and reset whenever a new
//! session starts, since codec state never carries over a reconnect.

use crate::config::PixelFormat;
use crate::frame::{AccessUnit, DecodedImage};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur while decoding an access unit.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Corrupt access unit: {0}")]
    Corrupt(String),

    #[error("Unsupported stream: {0}")]
    Unsupported(String),

    #[error("Decoder backend failure: {0}")]
    Backend(String),
}

/// A stateful decode context.
pub trait FrameDecoder: Send {
    /// Decode one access unit. Codecs with frame reordering may return no
    /// picture for one unit and several for a later one.
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<DecodedImage>, DecodeError>;

    /// Drop all codec state before the first unit of a new session.
    fn reset(&mut self) -> Result<(), DecodeError>;
}

/// Creates independent decode contexts.
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecodeError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

const RAW_MAGIC: &[u8; 4] = b"NRAW";
const RAW_HEADER_LEN: usize = 13;

fn format_code(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Rgb24 => 0,
        PixelFormat::Bgr24 => 1,
        PixelFormat::Rgba32 => 2,
        PixelFormat::Gray8 => 3,
    }
}

fn format_from_code(code: u8) -> Option<PixelFormat> {
    match code {
        0 => Some(PixelFormat::Rgb24),
        1 => Some(PixelFormat::Bgr24),
        2 => Some(PixelFormat::Rgba32),
        3 => Some(PixelFormat::Gray8),
        _ => None,
    }
}

/// Pack an uncompressed picture into a raw-video access unit.
///
/// Layout: `NRAW`, width (u32 LE), height (u32 LE), format code (u8), pixels.
pub fn encode_raw_unit(width: u32, height: u32, format: PixelFormat, pixels: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RAW_HEADER_LEN + pixels.len());
    buf.put_slice(RAW_MAGIC);
    buf.put_u32_le(width);
    buf.put_u32_le(height);
    buf.put_u8(format_code(format));
    buf.put_slice(pixels);
    buf.freeze()
}

/// Decoder for the uncompressed access units produced by the synthetic
/// source. Stateless, so `reset` is a no-op.
#[derive(Debug, Default)]
pub struct RawVideoDecoder;

impl FrameDecoder for RawVideoDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Vec<DecodedImage>, DecodeError> {
        let data = &unit.data[..];
        if data.len() < RAW_HEADER_LEN || &data[..4] != RAW_MAGIC {
            return Err(DecodeError::Corrupt("missing raw video header".to_string()));
        }

        let width = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let height = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let format = format_from_code(data[12])
            .ok_or_else(|| DecodeError::Unsupported(format!("pixel format code {}", data[12])))?;

        let payload = &data[RAW_HEADER_LEN..];
        match format.frame_size(width, height) {
            Some(expected) if expected > 0 && payload.len() == expected => {}
            expected => {
                return Err(DecodeError::Corrupt(format!(
                    "{}x{} {} needs {} bytes, got {}",
                    width,
                    height,
                    format,
                    expected.map_or_else(|| "too many".to_string(), |n| n.to_string()),
                    payload.len()
                )));
            }
        }

        Ok(vec![DecodedImage {
            data: payload.to_vec(),
            width,
            height,
            format,
            pts: unit.pts,
        }])
    }

    fn reset(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RawVideoDecoderFactory;

impl DecoderFactory for RawVideoDecoderFactory {
    fn create(&self) -> Result<Box<dyn FrameDecoder>, DecodeError> {
        Ok(Box::new(RawVideoDecoder))
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn unit(data: Bytes) -> AccessUnit {
        AccessUnit {
            data,
            pts: Some(42),
            session_id: 1,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn test_raw_unit_decodes() {
        let pixels = vec![7u8; 4 * 2 * 3];
        let encoded = encode_raw_unit(4, 2, PixelFormat::Bgr24, &pixels);

        let mut decoder = RawVideoDecoder;
        let images = decoder.decode(&unit(encoded)).unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, 4);
        assert_eq!(images[0].height, 2);
        assert_eq!(images[0].format, PixelFormat::Bgr24);
        assert_eq!(images[0].pts, Some(42));
        assert_eq!(images[0].data, pixels);
    }

    #[test]
    fn test_truncated_unit_rejected() {
        let encoded = encode_raw_unit(4, 2, PixelFormat::Rgb24, &[0u8; 10]);
        let mut decoder = RawVideoDecoder;
        assert!(matches!(
            decoder.decode(&unit(encoded)),
            Err(DecodeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let mut decoder = RawVideoDecoder;
        assert!(decoder
            .decode(&unit(Bytes::from_static(b"\x00\x00\x00\x01\x67")))
            .is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut decoder = RawVideoDecoder;
        for (width, height) in [(u32::MAX, u32::MAX), (u32::MAX, 2), (0, 4)] {
            let encoded = encode_raw_unit(width, height, PixelFormat::Rgba32, &[0u8; 16]);
            assert!(matches!(
                decoder.decode(&unit(encoded)),
                Err(DecodeError::Corrupt(_))
            ));
        }
    }

    #[test]
    fn test_unknown_format_code() {
        let mut encoded = encode_raw_unit(1, 1, PixelFormat::Gray8, &[0u8]).to_vec();
        encoded[12] = 9;
        let mut decoder = RawVideoDecoder;
        assert!(matches!(
            decoder.decode(&unit(Bytes::from(encoded))),
            Err(DecodeError::Unsupported(_))
        ));
    }
}
