//! V4L2 sensor backend using memory-mapped buffers

use std::io;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{CaptureProfile, PixelFormat};
use super::sensor::{pack_rows, skip_for_newer, GrabPolicy, RawCapture, Sensor};
use crate::error::SensorError;

/// Camera exposed through `/dev/videoN`
pub struct V4l2Sensor {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    path: String,
    format: PixelFormat,
    buffer_count: u32,
    width: u32,
    height: u32,
    /// Bytes between line starts as reported by the driver
    stride: u32,
}

impl V4l2Sensor {
    /// Open a capture device. Streaming starts on the first `configure`.
    pub fn open(path: &str, format: PixelFormat, buffer_count: u32) -> Result<Self, SensorError> {
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SensorError::Unsupported(format!(
                "{path} doesn't support video capture"
            )));
        }

        Ok(Self {
            device: Box::new(device),
            stream: None,
            path: path.to_string(),
            format,
            buffer_count: buffer_count.max(1),
            width: 0,
            height: 0,
            stride: 0,
        })
    }

    fn fourcc(&self) -> FourCC {
        match self.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Gray8 => FourCC::new(b"GREY"),
        }
    }

    fn start_stream(&mut self) -> Result<(), SensorError> {
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        self.stream = Some(stream);
        info!(
            "Capture stream started on {} with {} buffers",
            self.path, self.buffer_count
        );
        Ok(())
    }
}

impl Sensor for V4l2Sensor {
    #[instrument(skip(self))]
    fn grab(&mut self, policy: GrabPolicy) -> Result<RawCapture, SensorError> {
        let stream = self.stream.as_mut().ok_or(SensorError::NotStreaming)?;
        let handle = stream.handle();

        // The first dequeue waits for a frame. Under `Latest`, buffers the
        // driver has already filled are then drained without blocking and
        // only the newest one is kept.
        let mut skipped = 0;
        loop {
            let (buf, meta) = stream.next()?;
            if skip_for_newer(policy, skipped, self.buffer_count, || {
                Ok(handle.poll(libc::POLLIN, 0)? > 0)
            })? {
                skipped += 1;
                continue;
            }

            if buf.is_empty() {
                return Err(SensorError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "driver returned an empty buffer",
                )));
            }
            debug!(
                sequence = meta.sequence,
                bytes = buf.len(),
                skipped,
                "Dequeued V4L2 buffer"
            );

            let data = match self.format.raw_len(self.width, 1) {
                Some(row_len) => pack_rows(buf, self.stride as usize, row_len, self.height as usize),
                None => Bytes::copy_from_slice(buf),
            };
            return Ok(RawCapture {
                data,
                width: self.width,
                height: self.height,
                format: self.format,
            });
        }
    }

    fn configure(&mut self, profile: &CaptureProfile) -> Result<(), SensorError> {
        // Buffers must be unmapped before the format can change
        self.stream = None;

        let mut fmt = self.device.format()?;
        fmt.width = profile.width;
        fmt.height = profile.height;
        fmt.fourcc = self.fourcc();
        let applied = self.device.set_format(&fmt)?;

        if applied.fourcc != fmt.fourcc {
            return Err(SensorError::Unsupported(format!(
                "{} rejected pixel format {:?}",
                self.path, self.format
            )));
        }

        self.width = applied.width;
        self.height = applied.height;
        self.stride = applied.stride;
        info!(
            width = applied.width,
            height = applied.height,
            stride = applied.stride,
            "V4L2 format applied"
        );

        self.start_stream()
    }
}
