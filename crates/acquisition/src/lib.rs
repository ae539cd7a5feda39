//! Camera Acquisition Session
//!
//! Streams frames from a camera while keeping exposure, frame rate, black
//! level, gain and gamma consistent with what the device really sustains.
//!
//! Architecture:
//! ```text
//! set_* ──> SharedParameters ──(pending set)──> reconciliation pass ──> device
//!                                                       │
//!                                              FrameRateCalibrator
//!
//! driver thread ──> FrameBridge ──> broadcast ──> FrameStream (per subscriber)
//! ```

mod bridge;
mod config;
mod data_frame;
mod error;
mod parameters;
mod session;
mod source;

pub use bridge::FrameBridge;
pub use config::{CaptureConfig, DeviceWaitConfig};
pub use data_frame::{DataFrame, FrameGeometry};
pub use error::CaptureError;
pub use parameters::{AcquisitionParameters, Pending, SharedParameters};
pub use session::{wait_for_device_online, SessionState};
pub use source::{CaptureSource, FrameStream, SessionStats, StatsSnapshot, StreamEvent};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ignoring poison: every guarded value stays consistent between writes
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
