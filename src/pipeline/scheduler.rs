//! Once-a-day capture scheduling against the wall clock

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Hour and day-of-year in local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    /// 0..=23
    pub hour: u8,
    /// 0..=365, January 1st is 0
    pub day_of_year: u16,
}

impl ClockReading {
    pub fn from_naive(local: NaiveDateTime) -> Self {
        Self {
            hour: local.hour() as u8,
            day_of_year: local.ordinal0() as u16,
        }
    }
}

/// Source of local time. `None` means the clock has no lock yet.
pub trait WallClock: Send {
    fn now(&self) -> Option<ClockReading>;
}

/// Anything earlier than this means the RTC was never set
const MIN_SYNCED_YEAR: i32 = 2020;

/// System clock, read in the system time zone or a fixed UTC offset
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    offset: Option<FixedOffset>,
}

impl SystemClock {
    pub fn new(offset: Option<FixedOffset>) -> Self {
        Self { offset }
    }

    /// Reading for an arbitrary instant, `None` before the clock is synced
    pub fn reading_at(&self, instant: DateTime<Utc>) -> Option<ClockReading> {
        if instant.year() < MIN_SYNCED_YEAR {
            return None;
        }

        let local = match self.offset {
            Some(offset) => instant.with_timezone(&offset).naive_local(),
            None => instant.with_timezone(&Local).naive_local(),
        };
        Some(ClockReading::from_naive(local))
    }
}

impl WallClock for SystemClock {
    fn now(&self) -> Option<ClockReading> {
        self.reading_at(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Due,
    NotDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    pub capture_hour: u8,
    pub last_captured_day: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSchedule {
    last_captured_day: Option<u16>,
}

/// Decides, exactly once per calendar day, that the unattended capture is due
#[derive(Debug)]
pub struct CaptureScheduler {
    state: ScheduleState,
    state_file: Option<PathBuf>,
}

impl CaptureScheduler {
    /// In-memory schedule; forgets the last capture day on restart
    pub fn new(capture_hour: u8) -> Self {
        Self {
            state: ScheduleState {
                capture_hour: capture_hour.min(23),
                last_captured_day: None,
            },
            state_file: None,
        }
    }

    /// Schedule that survives restarts by recording the last capture day in
    /// `path`. A missing or unreadable file starts fresh.
    pub fn with_state_file(capture_hour: u8, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut scheduler = Self::new(capture_hour);
        scheduler.state.last_captured_day = load_last_day(&path);
        info!(
            file = %path.display(),
            last_captured_day = ?scheduler.state.last_captured_day,
            "Loaded schedule state"
        );
        scheduler.state_file = Some(path);
        scheduler
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    /// `Due` iff the configured hour has been reached and nothing was
    /// captured yet on this day of the year. The day is recorded before
    /// returning, so a second tick on the same day is always `NotDue`.
    pub fn tick(&mut self, now: Option<ClockReading>) -> Tick {
        let Some(now) = now else {
            return Tick::NotDue;
        };

        if now.hour < self.state.capture_hour
            || self.state.last_captured_day == Some(now.day_of_year)
        {
            return Tick::NotDue;
        }

        self.state.last_captured_day = Some(now.day_of_year);
        debug!(day_of_year = now.day_of_year, hour = now.hour, "Scheduled capture due");
        self.persist();
        Tick::Due
    }

    fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };

        let record = PersistedSchedule {
            last_captured_day: self.state.last_captured_day,
        };
        if let Err(e) = write_state(path, &record) {
            warn!(file = %path.display(), error = %e, "Failed to persist schedule state");
        }
    }
}

fn load_last_day(path: &Path) -> Option<u16> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Cannot read schedule state");
            return None;
        }
    };

    match serde_json::from_str::<PersistedSchedule>(&raw) {
        Ok(record) => record.last_captured_day.filter(|day| *day <= 365),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Ignoring corrupt schedule state");
            None
        }
    }
}

fn write_state(path: &Path, record: &PersistedSchedule) -> std::io::Result<()> {
    let json = serde_json::to_vec(record)?;
    let partial = path.with_extension("part");
    std::fs::write(&partial, json)?;
    std::fs::rename(&partial, path)
}
