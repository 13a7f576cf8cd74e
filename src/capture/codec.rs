//! Normalization of captured frames to JPEG

use std::borrow::Cow;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::trace;

use super::frame::{Frame, PixelFormat};
use crate::error::EncodingError;

/// A frame in the wire/storage format
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG bytes. Shares the sensor buffer when the frame was already JPEG.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: SystemTime,
    /// False for zero-copy pass-through
    pub transcoded: bool,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Turns any captured frame into JPEG
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// MJPEG frames pass through untouched; raw frames are encoded at
    /// `quality` (clamped to 1..=100) into a fresh buffer.
    pub fn normalize(&self, frame: &Frame, quality: u8) -> Result<EncodedFrame, EncodingError> {
        let meta = &frame.meta;

        if meta.format.is_jpeg() {
            return Ok(EncodedFrame {
                data: frame.data.clone(),
                width: meta.width,
                height: meta.height,
                sequence: meta.sequence,
                captured_at: meta.captured_at,
                transcoded: false,
            });
        }

        let started = Instant::now();
        let jpeg = encode_jpeg(&frame.data, meta.width, meta.height, meta.format, quality)?;
        let elapsed = started.elapsed();
        metrics::histogram!("encode_time_us").record(elapsed.as_micros() as f64);
        trace!(
            sequence = meta.sequence,
            bytes = jpeg.len(),
            ?elapsed,
            "Transcoded frame"
        );

        Ok(EncodedFrame {
            data: Bytes::from(jpeg),
            width: meta.width,
            height: meta.height,
            sequence: meta.sequence,
            captured_at: meta.captured_at,
            transcoded: true,
        })
    }
}

/// Encode a raw frame as baseline JPEG
pub fn encode_jpeg(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
) -> Result<Vec<u8>, EncodingError> {
    if width == 0 || height == 0 {
        return Err(EncodingError::EmptyFrame { width, height });
    }

    let Some(expected) = format.raw_len(width, height) else {
        // Already compressed
        return Ok(data.to_vec());
    };
    if data.len() < expected {
        return Err(EncodingError::BufferSize {
            format,
            width,
            height,
            expected,
            actual: data.len(),
        });
    }
    let data = &data[..expected];

    let (pixels, color): (Cow<'_, [u8]>, ExtendedColorType) = match format {
        PixelFormat::Rgb24 => (Cow::Borrowed(data), ExtendedColorType::Rgb8),
        PixelFormat::Gray8 => (Cow::Borrowed(data), ExtendedColorType::L8),
        PixelFormat::Bgr24 => (Cow::Owned(bgr_to_rgb(data)), ExtendedColorType::Rgb8),
        PixelFormat::Yuyv4 => (Cow::Owned(yuyv_to_rgb(data)), ExtendedColorType::Rgb8),
        PixelFormat::Mjpeg => return Ok(data.to_vec()),
    };

    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&pixels, width, height, color)?;
    Ok(out)
}

fn bgr_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

/// YUYV 4:2:2 to packed RGB using BT.601 coefficients.
///
/// Each 4-byte group `[Y0, U, Y1, V]` yields two pixels sharing U and V.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);

    for chunk in data.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;

        for y in [chunk[0] as f32, chunk[2] as f32] {
            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            rgb.extend_from_slice(&[r, g, b]);
        }
    }

    rgb
}
