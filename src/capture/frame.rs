use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime};

/// Identity of whoever holds a buffer checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Gray8,
    Mjpeg,
}

impl PixelFormat {
    /// Already in the wire format, no transcode needed
    pub fn is_jpeg(self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Buffer length of an uncompressed frame. `None` for compressed formats.
    pub fn raw_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Yuyv4 => Some(pixels * 2),
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// Resolution and JPEG quality applied to the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureProfile {
    pub width: u32,
    pub height: u32,
    /// 1..=100, lower is smaller and lossier
    pub quality: u8,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Wall-clock capture time
    pub captured_at: SystemTime,
}

/// One outstanding checkout of a pool slot.
///
/// `generation` changes on every acquire of the slot, so a checkout kept
/// around after release can never match a later owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkout {
    pub(crate) source: u64,
    pub slot: usize,
    pub generation: u64,
    pub consumer: ConsumerId,
}

/// A captured frame, exclusively owned by the consumer that acquired it.
///
/// Not `Clone`: the only way back into the pool is
/// [`FrameSource::release`](crate::capture::FrameSource::release).
pub struct Frame {
    /// Immutable frame data
    pub data: Bytes,

    pub meta: FrameMetadata,

    /// Monotonic capture instant for latency tracking
    pub timestamp: Instant,

    checkout: Checkout,
}

impl Frame {
    pub(crate) fn new(data: Bytes, meta: FrameMetadata, checkout: Checkout) -> Self {
        Self {
            data,
            meta,
            timestamp: Instant::now(),
            checkout,
        }
    }

    pub fn checkout(&self) -> Checkout {
        self.checkout
    }

    pub fn consumer(&self) -> ConsumerId {
        self.checkout.consumer
    }

    pub fn is_jpeg(&self) -> bool {
        self.meta.format.is_jpeg()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .field("checkout", &self.checkout)
            .finish()
    }
}
