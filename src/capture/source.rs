//! Checkout gate in front of the one physical sensor
//!
//! The pool is a fixed table of slots. A slot is `Free`, `Owned` by exactly
//! one consumer, or `Converting` while its owner transcodes it. Every
//! successful [`FrameSource::acquire`] must be matched by exactly one
//! [`FrameSource::release`]; anything else is rejected with a
//! [`ReleaseError`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, instrument, warn};

use super::codec::{EncodedFrame, FrameCodec};
use super::frame::{CaptureProfile, Checkout, ConsumerId, Frame, FrameMetadata};
use super::illumination::{Illumination, NoIllumination};
use super::sensor::{GrabPolicy, Sensor};
use crate::error::{AcquireError, EncodingError, ReleaseError, SensorError};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Owned(ConsumerId),
    Converting(ConsumerId),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    generation: u64,
}

/// Flash held on for as long as the guard lives
struct Lit<'a> {
    illumination: &'a mut dyn Illumination,
}

impl<'a> Lit<'a> {
    fn on(illumination: &'a mut dyn Illumination) -> Self {
        if let Err(e) = illumination.on() {
            warn!(error = %e, "Flash did not switch on, capturing anyway");
        }
        Self { illumination }
    }
}

impl Drop for Lit<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.illumination.off() {
            warn!(error = %e, "Flash did not switch off");
        }
    }
}

/// Lifetime counters, mostly for tests and logging
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub acquired: u64,
    pub released: u64,
    pub busy: u64,
    pub hardware_failures: u64,
    pub rejected_releases: u64,
}

pub struct FrameSource {
    id: u64,
    sensor: Box<dyn Sensor>,
    illumination: Box<dyn Illumination>,
    slots: Vec<Slot>,
    policy: GrabPolicy,
    still_profile: CaptureProfile,
    active_profile: CaptureProfile,
    streaming_sessions: usize,
    sequence: u64,
    stats: SourceStats,
}

impl FrameSource {
    /// Wrap a sensor with a pool of `pool_size` slots (at least one) and
    /// apply the still profile.
    pub fn new(
        mut sensor: Box<dyn Sensor>,
        illumination: Box<dyn Illumination>,
        pool_size: usize,
        policy: GrabPolicy,
        still_profile: CaptureProfile,
    ) -> Result<Self, SensorError> {
        sensor.configure(&still_profile)?;

        let slots = vec![
            Slot {
                state: SlotState::Free,
                generation: 0,
            };
            pool_size.max(1)
        ];

        Ok(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            sensor,
            illumination,
            slots,
            policy,
            still_profile,
            active_profile: still_profile,
            streaming_sessions: 0,
            sequence: 0,
            stats: SourceStats::default(),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    pub fn policy(&self) -> GrabPolicy {
        self.policy
    }

    /// Number of slots currently checked out
    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count()
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    pub fn active_profile(&self) -> CaptureProfile {
        self.active_profile
    }

    pub fn streaming_sessions(&self) -> usize {
        self.streaming_sessions
    }

    /// Check out the next frame for `consumer`.
    ///
    /// Fails with `Busy` when every slot is checked out. A sensor error
    /// leaves the pool untouched and is reported as-is, never retried.
    pub fn acquire(&mut self, consumer: ConsumerId) -> Result<Frame, AcquireError> {
        let Some(slot) = self.slots.iter().position(|s| s.state == SlotState::Free) else {
            self.stats.busy += 1;
            return Err(AcquireError::Busy {
                pool_size: self.slots.len(),
            });
        };

        let raw = match self.sensor.grab(self.policy) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.hardware_failures += 1;
                metrics::counter!("sensor_failures_total").increment(1);
                return Err(AcquireError::HardwareFailure(e));
            }
        };

        let entry = &mut self.slots[slot];
        entry.generation += 1;
        entry.state = SlotState::Owned(consumer);
        self.sequence += 1;
        self.stats.acquired += 1;

        let checkout = Checkout {
            source: self.id,
            slot,
            generation: entry.generation,
            consumer,
        };
        let meta = FrameMetadata {
            sequence: self.sequence,
            width: raw.width,
            height: raw.height,
            format: raw.format,
            captured_at: SystemTime::now(),
        };

        debug!(%consumer, slot, sequence = self.sequence, "Frame checked out");
        Ok(Frame::new(raw.data, meta, checkout))
    }

    /// Return a frame's slot to the pool
    pub fn release(&mut self, frame: Frame) -> Result<(), ReleaseError> {
        self.release_checkout(frame.checkout())
    }

    /// Return a slot by its checkout record. Rejects double releases, stale
    /// or foreign checkouts and releases by a consumer that is not the owner.
    pub fn release_checkout(&mut self, checkout: Checkout) -> Result<(), ReleaseError> {
        let result = self.validate(checkout).and_then(|slot| match slot.state {
            SlotState::Owned(_) => Ok(()),
            SlotState::Converting(_) => Err(ReleaseError::Converting {
                slot: checkout.slot,
            }),
            SlotState::Free => Err(ReleaseError::NotCheckedOut {
                slot: checkout.slot,
            }),
        });

        match result {
            Ok(()) => {
                self.slots[checkout.slot].state = SlotState::Free;
                self.stats.released += 1;
                debug!(consumer = %checkout.consumer, slot = checkout.slot, "Frame released");
                Ok(())
            }
            Err(e) => {
                self.stats.rejected_releases += 1;
                warn!(error = %e, "Rejected frame release");
                Err(e)
            }
        }
    }

    /// Normalize a checked-out frame, marking its slot `Converting` for the
    /// duration. The caller still owns the frame and must release it.
    pub fn convert(
        &mut self,
        frame: &Frame,
        codec: &FrameCodec,
        quality: u8,
    ) -> Result<EncodedFrame, EncodingError> {
        let checkout = frame.checkout();
        let slot = self.validate(checkout)?;
        if let SlotState::Converting(_) = slot.state {
            return Err(ReleaseError::Converting {
                slot: checkout.slot,
            }
            .into());
        }

        self.slots[checkout.slot].state = SlotState::Converting(checkout.consumer);
        let encoded = codec.normalize(frame, quality);
        self.slots[checkout.slot].state = SlotState::Owned(checkout.consumer);

        encoded
    }

    /// Acquire with the flash lit: on, wait `stabilization`, acquire, wait
    /// `trailing`, off.
    ///
    /// This is the only call that holds the loop for a bounded time. The
    /// flash is switched off by a guard on every path, including `Busy` and
    /// hardware failure, and whether or not switching it on worked.
    #[instrument(skip(self))]
    pub fn with_flash(
        &mut self,
        consumer: ConsumerId,
        stabilization: Duration,
        trailing: Duration,
    ) -> Result<Frame, AcquireError> {
        let mut illumination = std::mem::replace(&mut self.illumination, Box::new(NoIllumination));

        let result = {
            let _lit = Lit::on(illumination.as_mut());
            thread::sleep(stabilization);
            let result = self.acquire(consumer);
            thread::sleep(trailing);
            result
        };

        self.illumination = illumination;
        result
    }

    /// Register a stream session. The first one switches the sensor to the
    /// stream profile. The count is taken even if reconfiguring fails, so
    /// every call must be paired with [`FrameSource::leave_streaming`].
    pub fn enter_streaming(&mut self, profile: CaptureProfile) -> Result<(), SensorError> {
        self.streaming_sessions += 1;
        if self.streaming_sessions > 1 {
            return Ok(());
        }
        self.apply_profile(profile)
    }

    /// Unregister a stream session; the last one restores the still profile
    pub fn leave_streaming(&mut self) -> Result<(), SensorError> {
        self.streaming_sessions = self.streaming_sessions.saturating_sub(1);
        if self.streaming_sessions > 0 {
            return Ok(());
        }
        self.apply_profile(self.still_profile)
    }

    fn apply_profile(&mut self, profile: CaptureProfile) -> Result<(), SensorError> {
        if profile == self.active_profile {
            return Ok(());
        }
        self.sensor.configure(&profile)?;
        debug!(?profile, "Sensor profile applied");
        self.active_profile = profile;
        Ok(())
    }

    fn validate(&self, checkout: Checkout) -> Result<Slot, ReleaseError> {
        if checkout.source != self.id {
            return Err(ReleaseError::ForeignSource);
        }

        let slot = *self
            .slots
            .get(checkout.slot)
            .ok_or(ReleaseError::UnknownSlot {
                slot: checkout.slot,
                pool_size: self.slots.len(),
            })?;

        let owner = match slot.state {
            SlotState::Free => {
                return Err(ReleaseError::NotCheckedOut {
                    slot: checkout.slot,
                })
            }
            SlotState::Owned(owner) | SlotState::Converting(owner) => owner,
        };

        if slot.generation != checkout.generation {
            return Err(ReleaseError::Stale {
                slot: checkout.slot,
                held: checkout.generation,
                current: slot.generation,
            });
        }

        if owner != checkout.consumer {
            return Err(ReleaseError::NotOwner {
                slot: checkout.slot,
                owner,
                caller: checkout.consumer,
            });
        }

        Ok(slot)
    }
}
