//! Acquisition Parameters
//!
//! Values live behind one mutex; which of them still have to reach the
//! device is tracked in a separate atomic [`Pending`] set. A setter writes
//! the value and marks it pending while holding the lock, so the
//! reconciliation pass, which swaps the whole set out at once, never sees a
//! flag without its value.

use crate::{lock, CaptureConfig};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

bitflags! {
    /// Parameters written by the application but not yet applied to the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pending: u8 {
        const EXPOSURE_TIME = 1 << 0;
        const FRAME_RATE = 1 << 1;
        const BLACK_LEVEL = 1 << 2;
        const GAIN = 1 << 3;
        const GAMMA = 1 << 4;
    }
}

/// Floor to two decimal places
pub(crate) fn floor2(value: f64) -> f64 {
    // Nudge so values already on the grid (186.91 * 100 = 18690.999..) stay put
    ((value * 100.0) + 1e-6).floor() / 100.0
}

/// Snapshot of the session parameters. Zero means "take the hardware value".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AcquisitionParameters {
    pub exposure_time_ms: f64,
    /// Always floored to 0.01 fps
    pub frame_rate_fps: f64,
    pub black_level: f64,
    pub gain: f64,
    pub gamma: f64,
    pub use_max_frame_rate: bool,
}

impl From<&CaptureConfig> for AcquisitionParameters {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            exposure_time_ms: config.exposure_time_ms,
            frame_rate_fps: floor2(config.frame_rate_fps),
            black_level: config.black_level,
            gain: config.gain,
            gamma: config.gamma,
            use_max_frame_rate: config.use_max_frame_rate,
        }
    }
}

/// Parameters shared between application setters and the session worker
#[derive(Debug)]
pub struct SharedParameters {
    values: Mutex<AcquisitionParameters>,
    pending: AtomicU8,
}

impl SharedParameters {
    pub fn new(initial: AcquisitionParameters) -> Self {
        Self {
            values: Mutex::new(initial),
            pending: AtomicU8::new(0),
        }
    }

    fn set(&self, flag: Pending, write: impl FnOnce(&mut AcquisitionParameters)) {
        let mut values = lock(&self.values);
        write(&mut values);
        self.pending.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn set_exposure_time_ms(&self, value: f64) {
        self.set(Pending::EXPOSURE_TIME, |p| p.exposure_time_ms = value);
    }

    pub fn set_frame_rate_fps(&self, value: f64) {
        self.set(Pending::FRAME_RATE, |p| p.frame_rate_fps = floor2(value));
    }

    pub fn set_black_level(&self, value: f64) {
        self.set(Pending::BLACK_LEVEL, |p| p.black_level = value);
    }

    pub fn set_gain(&self, value: f64) {
        self.set(Pending::GAIN, |p| p.gain = value);
    }

    pub fn set_gamma(&self, value: f64) {
        self.set(Pending::GAMMA, |p| p.gamma = value);
    }

    /// Toggling re-targets the frame rate, so it marks frame rate pending
    pub fn set_use_max_frame_rate(&self, value: bool) {
        self.set(Pending::FRAME_RATE, |p| p.use_max_frame_rate = value);
    }

    pub fn snapshot(&self) -> AcquisitionParameters {
        *lock(&self.values)
    }

    pub fn pending(&self) -> Pending {
        Pending::from_bits_truncate(self.pending.load(Ordering::SeqCst))
    }

    /// Clear and return the pending set
    pub fn take_pending(&self) -> Pending {
        Pending::from_bits_truncate(self.pending.swap(0, Ordering::SeqCst))
    }

    /// Put back flags a failed pass did not get to apply
    pub fn restore_pending(&self, pending: Pending) {
        self.pending.fetch_or(pending.bits(), Ordering::SeqCst);
    }

    /// Record values read back from or applied to the device.
    ///
    /// Fields in `fields` are only overwritten when the application has not
    /// requested a new value since the pending set was taken.
    pub(crate) fn store_applied(&self, fields: Pending, applied: &AcquisitionParameters) {
        let mut values = lock(&self.values);
        let free = fields.difference(self.pending());
        if free.contains(Pending::EXPOSURE_TIME) {
            values.exposure_time_ms = applied.exposure_time_ms;
        }
        if free.contains(Pending::FRAME_RATE) {
            values.frame_rate_fps = floor2(applied.frame_rate_fps);
        }
        if free.contains(Pending::BLACK_LEVEL) {
            values.black_level = applied.black_level;
        }
        if free.contains(Pending::GAIN) {
            values.gain = applied.gain;
        }
        if free.contains(Pending::GAMMA) {
            values.gamma = applied.gamma;
        }
    }
}
