//! Flash LED control
//!
//! Only [`FrameSource::with_flash`](crate::capture::FrameSource::with_flash)
//! switches illumination, so on/off always brackets a checkout.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

/// GPIO-level illumination primitive
pub trait Illumination: Send {
    fn on(&mut self) -> io::Result<()>;
    fn off(&mut self) -> io::Result<()>;
}

/// Board without a flash
#[derive(Debug, Default)]
pub struct NoIllumination;

impl Illumination for NoIllumination {
    fn on(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn off(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// LED exposed by the kernel at `/sys/class/leds/<name>`
#[derive(Debug)]
pub struct SysfsLed {
    path: PathBuf,
    max_brightness: u32,
}

impl SysfsLed {
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_at(Path::new("/sys/class/leds").join(name))
    }

    pub fn open_at(path: PathBuf) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path.join("max_brightness"))?;
        let max_brightness = raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid max_brightness {:?}", raw.trim()),
                )
            })?;

        info!(path = %path.display(), max_brightness, "Opened flash LED");
        Ok(Self {
            path,
            max_brightness,
        })
    }

    fn set_brightness(&self, value: u32) -> io::Result<()> {
        std::fs::write(
            self.path.join("brightness"),
            value.min(self.max_brightness).to_string(),
        )
    }
}

impl Illumination for SysfsLed {
    fn on(&mut self) -> io::Result<()> {
        self.set_brightness(self.max_brightness)
    }

    fn off(&mut self) -> io::Result<()> {
        self.set_brightness(0)
    }
}

/// In-memory LED for simulation and tests
#[derive(Debug, Default)]
pub struct SimulatedLed {
    probe: LedProbe,
}

/// Observer for a [`SimulatedLed`] after it has been handed off
#[derive(Debug, Clone, Default)]
pub struct LedProbe {
    lit: Arc<AtomicBool>,
    switches: Arc<AtomicU64>,
    fail_on: Arc<AtomicBool>,
}

impl LedProbe {
    pub fn is_on(&self) -> bool {
        self.lit.load(Ordering::SeqCst)
    }

    /// Number of on/off calls so far
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::SeqCst)
    }

    /// Make every `on()` fail after switching the LED on
    pub fn fail_on(&self, fail: bool) {
        self.fail_on.store(fail, Ordering::SeqCst);
    }
}

impl SimulatedLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> LedProbe {
        self.probe.clone()
    }
}

impl Illumination for SimulatedLed {
    fn on(&mut self) -> io::Result<()> {
        self.probe.switches.fetch_add(1, Ordering::SeqCst);
        self.probe.lit.store(true, Ordering::SeqCst);
        debug!("Simulated flash on");
        if self.probe.fail_on.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated flash fault"));
        }
        Ok(())
    }

    fn off(&mut self) -> io::Result<()> {
        self.probe.switches.fetch_add(1, Ordering::SeqCst);
        self.probe.lit.store(false, Ordering::SeqCst);
        debug!("Simulated flash off");
        Ok(())
    }
}
