//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use plantcam::capture::{
    CaptureProfile, EncodedFrame, FrameSource, GrabPolicy, NoIllumination, PixelFormat,
    SensorControls, SimulatedSensor,
};
use plantcam::error::{StorageError, TransportError};
use plantcam::pipeline::{
    ClockReading, FlashSettings, OrchestratorSettings, StreamSettings, Transport, WallClock,
};
use plantcam::storage::ImageStore;

pub const STILL: CaptureProfile = CaptureProfile {
    width: 32,
    height: 24,
    quality: 80,
};

pub const STREAM: CaptureProfile = CaptureProfile {
    width: 16,
    height: 12,
    quality: 60,
};

pub fn source(format: PixelFormat, pool_size: usize) -> (FrameSource, SensorControls) {
    let sensor = SimulatedSensor::new(format);
    let controls = sensor.controls();
    let source = FrameSource::new(
        Box::new(sensor),
        Box::new(NoIllumination),
        pool_size,
        GrabPolicy::Latest,
        STILL,
    )
    .unwrap();
    (source, controls)
}

pub fn stream_settings() -> StreamSettings {
    StreamSettings {
        boundary: "frame".into(),
        frame_interval: Duration::ZERO,
        profile: STREAM,
    }
}

pub fn orchestrator_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        still_quality: 80,
        flash: FlashSettings {
            scheduled: false,
            stabilization: Duration::ZERO,
            trailing: Duration::ZERO,
        },
        stream: stream_settings(),
        poll_interval: Duration::from_millis(1),
        max_capture_attempts: 3,
    }
}

/// Store keeping images in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub saved: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    pub fail: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn names(&self) -> Vec<String> {
        self.saved.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

impl ImageStore for MemoryStore {
    fn store(&mut self, frame: &EncodedFrame, hint: &str) -> Result<String, StorageError> {
        if *self.fail.lock().unwrap() {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        let mut saved = self.saved.lock().unwrap();
        let name = format!("{hint}_{:04}.jpg", saved.len());
        saved.push((name.clone(), frame.data.to_vec()));
        Ok(name)
    }
}

/// What a [`ScriptedTransport`] observed
#[derive(Debug, Default)]
pub struct WireLog {
    pub bytes: Vec<u8>,
    pub parts: usize,
    pub writes: usize,
}

/// Transport with scripted failures
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub log: Arc<Mutex<WireLog>>,
    /// Report disconnected once this many parts went out
    pub disconnect_after: Option<usize>,
    /// Fail the body write of this part (1-based), after the header went out
    pub fail_on_part: Option<usize>,
    pub fail_handshake: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parts(&self) -> usize {
        self.log.lock().unwrap().parts
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.log.lock().unwrap().bytes.clone()
    }
}

impl Transport for ScriptedTransport {
    fn is_connected(&self) -> bool {
        match self.disconnect_after {
            Some(n) => self.log.lock().unwrap().parts < n,
            None => true,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        if log.writes == 0 && self.fail_handshake {
            return Err(TransportError::Disconnected);
        }
        log.writes += 1;
        log.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn write_part(&mut self, header: &[u8], body: &bytes::Bytes) -> Result<(), TransportError> {
        let part = self.log.lock().unwrap().parts + 1;
        self.write_bytes(header)?;
        if self.fail_on_part == Some(part) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer reset",
            )));
        }
        self.write_bytes(body)?;
        self.write_bytes(b"\r\n")?;
        self.log.lock().unwrap().parts += 1;
        Ok(())
    }
}

/// Clock the test sets by hand
#[derive(Clone, Default)]
pub struct ManualClock {
    reading: Arc<Mutex<Option<ClockReading>>>,
}

impl ManualClock {
    pub fn set(&self, hour: u8, day_of_year: u16) {
        *self.reading.lock().unwrap() = Some(ClockReading { hour, day_of_year });
    }

    pub fn unsync(&self) {
        *self.reading.lock().unwrap() = None;
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> Option<ClockReading> {
        *self.reading.lock().unwrap()
    }
}
