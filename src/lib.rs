pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod storage;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::{CaptureProfile, GrabPolicy, Illumination, NoIllumination, PixelFormat, Sensor};
use chrono::FixedOffset;
use error::{ConfigError, SensorError};
use pipeline::{FlashSettings, OrchestratorSettings, StreamSettings};
use serde::{Deserialize, Serialize};
use storage::Naming;

/// Environment variables override file values, e.g. `PLANTCAM_SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "PLANTCAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub schedule: ScheduleConfig,
    pub flash: FlashConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Simulated,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sensor: SensorKind,
    /// V4L2 device node, auto-detected when unset
    pub device: Option<String>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// JPEG quality for stored stills
    pub quality: u8,
    /// Frames that may be checked out at once
    pub pool_size: usize,
    /// Driver-side mmap buffers
    pub buffer_count: u32,
    pub grab_policy: GrabPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub frame_interval_ms: u64,
    pub boundary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub capture_hour: u8,
    /// Fixed offset from UTC; the system time zone when unset
    pub utc_offset_minutes: Option<i32>,
    /// Remembers the last captured day across restarts
    pub state_file: Option<PathBuf>,
    pub use_flash: bool,
    pub poll_interval_ms: u64,
    pub max_capture_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Name under `/sys/class/leds`; no flash when unset
    pub led: Option<String>,
    pub stabilization_ms: u64,
    pub trailing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub extension: String,
    pub naming: Naming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Queued multipart parts per viewer before frames are skipped
    pub stream_buffer: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sensor: SensorKind::Simulated,
            device: None,
            format: PixelFormat::Mjpeg,
            width: 800,
            height: 600,
            quality: 80,
            pool_size: 2,
            buffer_count: 4,
            grab_policy: GrabPolicy::Latest,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            quality: 60,
            frame_interval_ms: 40,
            boundary: "frame".into(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            capture_hour: 15,
            utc_offset_minutes: None,
            state_file: None,
            use_flash: false,
            poll_interval_ms: 10,
            max_capture_attempts: 3,
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            led: None,
            stabilization_ms: 300,
            trailing_ms: 50,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("captures"),
            prefix: "plant_".into(),
            extension: ".jpg".into(),
            naming: Naming::Sequence,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            stream_buffer: 2,
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then `PLANTCAM_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.schedule.capture_hour > 23 {
            return invalid(format!(
                "schedule.capture_hour must be 0..=23, got {}",
                self.schedule.capture_hour
            ));
        }
        for (name, quality) in [
            ("capture.quality", self.capture.quality),
            ("stream.quality", self.stream.quality),
        ] {
            if !(1..=100).contains(&quality) {
                return invalid(format!("{name} must be 1..=100, got {quality}"));
            }
        }
        if self.capture.width == 0
            || self.capture.height == 0
            || self.stream.width == 0
            || self.stream.height == 0
        {
            return invalid("capture and stream resolutions must be non-zero".into());
        }
        if self.capture.pool_size == 0 || self.capture.buffer_count == 0 {
            return invalid("capture.pool_size and capture.buffer_count must be at least 1".into());
        }
        if self.stream.boundary.is_empty()
            || self.stream.boundary.chars().any(char::is_whitespace)
        {
            return invalid(format!(
                "stream.boundary must be a non-empty token, got {:?}",
                self.stream.boundary
            ));
        }
        if self.schedule.max_capture_attempts == 0 {
            return invalid("schedule.max_capture_attempts must be at least 1".into());
        }
        if let Some(minutes) = self.schedule.utc_offset_minutes {
            if FixedOffset::east_opt(minutes * 60).is_none() {
                return invalid(format!("schedule.utc_offset_minutes out of range: {minutes}"));
            }
        }
        Ok(())
    }

    pub fn still_profile(&self) -> CaptureProfile {
        CaptureProfile {
            width: self.capture.width,
            height: self.capture.height,
            quality: self.capture.quality,
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            boundary: self.stream.boundary.clone(),
            frame_interval: Duration::from_millis(self.stream.frame_interval_ms),
            profile: CaptureProfile {
                width: self.stream.width,
                height: self.stream.height,
                quality: self.stream.quality,
            },
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            still_quality: self.capture.quality,
            flash: FlashSettings {
                scheduled: self.schedule.use_flash,
                stabilization: Duration::from_millis(self.flash.stabilization_ms),
                trailing: Duration::from_millis(self.flash.trailing_ms),
            },
            stream: self.stream_settings(),
            poll_interval: Duration::from_millis(self.schedule.poll_interval_ms),
            max_capture_attempts: self.schedule.max_capture_attempts,
        }
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        self.schedule
            .utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
    }

    /// Build the configured sensor
    pub fn open_sensor(&self) -> Result<Box<dyn Sensor>, SensorError> {
        match self.capture.sensor {
            SensorKind::Simulated => Ok(Box::new(capture::SimulatedSensor::new(
                self.capture.format,
            ))),
            #[cfg(feature = "v4l2")]
            SensorKind::V4l2 => {
                let device = match &self.capture.device {
                    Some(path) => utils::FoundDevice {
                        path: path.clone(),
                        format: self.capture.format,
                    },
                    None => utils::auto_detect_device()?,
                };
                tracing::info!("Using capture device: {:?}", device);
                Ok(Box::new(capture::V4l2Sensor::open(
                    &device.path,
                    device.format,
                    self.capture.buffer_count,
                )?))
            }
            #[cfg(not(feature = "v4l2"))]
            SensorKind::V4l2 => Err(SensorError::Unsupported(
                "built without the v4l2 feature".into(),
            )),
        }
    }

    /// Build the configured flash, or none
    pub fn open_illumination(&self) -> Result<Box<dyn Illumination>, SensorError> {
        match &self.flash.led {
            Some(name) => Ok(Box::new(capture::SysfsLed::open(name)?)),
            None => Ok(Box::new(NoIllumination)),
        }
    }
}
