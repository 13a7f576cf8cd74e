//! Sensor backends feeding the frame pool

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::codec::encode_jpeg;
use super::frame::{CaptureProfile, PixelFormat};
use crate::error::SensorError;

/// What the sensor hands out when its queue holds more than one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabPolicy {
    /// Drop stale frames in favour of the freshest one
    #[default]
    Latest,
    /// Hand out queued frames in capture order
    WhenEmpty,
}

/// One frame as read off the sensor
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Whether the frame in hand should be dropped for a newer one. Only
/// `Latest` skips, at most `limit` times per grab, and only while
/// `newer_ready` reports a frame that can be had without waiting.
pub fn skip_for_newer(
    policy: GrabPolicy,
    skipped: u32,
    limit: u32,
    newer_ready: impl FnOnce() -> io::Result<bool>,
) -> io::Result<bool> {
    if policy != GrabPolicy::Latest || skipped >= limit {
        return Ok(false);
    }
    newer_ready()
}

/// Strip row padding from a driver buffer whose lines are `stride` bytes
/// apart but only `row_len` bytes long. Missing trailing rows are left out.
pub fn pack_rows(buf: &[u8], stride: usize, row_len: usize, height: usize) -> Bytes {
    if stride <= row_len {
        return Bytes::copy_from_slice(buf);
    }
    let mut packed = Vec::with_capacity(row_len * height);
    for row in buf.chunks(stride).take(height) {
        packed.extend_from_slice(&row[..row.len().min(row_len)]);
    }
    Bytes::from(packed)
}

/// A physical (or simulated) image sensor
pub trait Sensor: Send {
    /// Read one frame. Blocks for at most one frame interval.
    fn grab(&mut self, policy: GrabPolicy) -> Result<RawCapture, SensorError>;

    /// Apply resolution and compression settings
    fn configure(&mut self, profile: &CaptureProfile) -> Result<(), SensorError>;
}

/// Shared knobs for a [`SimulatedSensor`], usable after the sensor has been
/// moved into a frame source.
#[derive(Debug, Clone, Default)]
pub struct SensorControls {
    inner: Arc<ControlsInner>,
}

#[derive(Debug, Default)]
struct ControlsInner {
    fail_next: AtomicU32,
    grabs: AtomicU64,
    profiles: Mutex<Vec<CaptureProfile>>,
}

impl SensorControls {
    /// Make the next `count` grabs report an I/O error
    pub fn fail_next(&self, count: u32) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Successful grabs so far
    pub fn grabs(&self) -> u64 {
        self.inner.grabs.load(Ordering::SeqCst)
    }

    /// Every profile applied, oldest first
    pub fn profiles(&self) -> Vec<CaptureProfile> {
        self.inner
            .profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Synthetic gradient frames for running without a camera
pub struct SimulatedSensor {
    format: PixelFormat,
    profile: CaptureProfile,
    counter: u8,
    jpeg: Option<Bytes>,
    controls: SensorControls,
}

impl SimulatedSensor {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            profile: CaptureProfile {
                width: 64,
                height: 48,
                quality: 80,
            },
            counter: 0,
            jpeg: None,
            controls: SensorControls::default(),
        }
    }

    pub fn controls(&self) -> SensorControls {
        self.controls.clone()
    }

    fn gradient(&self, width: u32, height: u32) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                rgb.extend_from_slice(&[r, g, self.counter]);
            }
        }
        rgb
    }

    fn render(&self) -> Result<Bytes, SensorError> {
        let CaptureProfile { width, height, .. } = self.profile;
        let rgb = self.gradient(width, height);

        let data = match self.format {
            PixelFormat::Rgb24 => rgb,
            PixelFormat::Bgr24 => rgb
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Gray8 => rgb.chunks_exact(3).map(|px| px[0] / 2 + px[1] / 2).collect(),
            PixelFormat::Yuyv4 => rgb
                .chunks_exact(6)
                .flat_map(|px| [px[0], 128, px[3], 128])
                .collect(),
            PixelFormat::Mjpeg => {
                let jpeg = encode_jpeg(&rgb, width, height, PixelFormat::Rgb24, self.profile.quality)
                    .map_err(|e| SensorError::Io(io::Error::other(e.to_string())))?;
                return Ok(Bytes::from(jpeg));
            }
        };

        Ok(Bytes::from(data))
    }
}

impl Sensor for SimulatedSensor {
    fn grab(&mut self, _policy: GrabPolicy) -> Result<RawCapture, SensorError> {
        if self.controls.take_failure() {
            return Err(SensorError::Io(io::Error::other("simulated sensor fault")));
        }

        let data = match (&self.jpeg, self.format) {
            (Some(jpeg), PixelFormat::Mjpeg) => jpeg.clone(),
            _ => {
                let data = self.render()?;
                if self.format.is_jpeg() {
                    self.jpeg = Some(data.clone());
                }
                data
            }
        };
        self.counter = self.counter.wrapping_add(1);
        self.controls.inner.grabs.fetch_add(1, Ordering::SeqCst);

        Ok(RawCapture {
            data,
            width: self.profile.width,
            height: self.profile.height,
            format: self.format,
        })
    }

    fn configure(&mut self, profile: &CaptureProfile) -> Result<(), SensorError> {
        debug!(?profile, "Simulated sensor reconfigured");
        self.profile = *profile;
        self.jpeg = None;
        self.controls
            .inner
            .profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_skips_only_ready_frames() {
        assert!(skip_for_newer(GrabPolicy::Latest, 0, 4, || Ok(true)).unwrap());
        assert!(!skip_for_newer(GrabPolicy::Latest, 0, 4, || Ok(false)).unwrap());
    }

    #[test]
    fn skipping_never_waits_past_the_limit() {
        let polled = std::cell::Cell::new(false);
        let ready = || {
            polled.set(true);
            Ok(true)
        };
        assert!(!skip_for_newer(GrabPolicy::Latest, 4, 4, ready).unwrap());
        assert!(!polled.get());
    }

    #[test]
    fn when_empty_keeps_queue_order() {
        let ready = || -> io::Result<bool> { panic!("queue must not be polled") };
        assert!(!skip_for_newer(GrabPolicy::WhenEmpty, 0, 4, ready).unwrap());
    }

    #[test]
    fn poll_errors_propagate() {
        let failed = skip_for_newer(GrabPolicy::Latest, 0, 4, || Err(io::Error::other("EBADF")));
        assert!(failed.is_err());
    }

    #[test]
    fn padded_rows_are_packed() {
        // 2x3 gray image, lines padded to 4 bytes
        let buf = [1, 2, 0, 0, 3, 4, 0, 0, 5, 6, 0, 0];
        assert_eq!(&pack_rows(&buf, 4, 2, 3)[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn tight_rows_are_copied_as_is() {
        let buf = [1, 2, 3, 4, 5, 6];
        assert_eq!(&pack_rows(&buf, 3, 3, 2)[..], &buf);
    }

    #[test]
    fn short_final_line_is_kept() {
        // Drivers may omit the padding after the last line
        let buf = [1, 2, 9, 9, 3, 4];
        assert_eq!(&pack_rows(&buf, 4, 2, 2)[..], &[1, 2, 3, 4]);
    }
}
