//! Camera Device Interface
//!
//! Feature access, frame delivery and open/close lifecycle for GenICam
//! cameras driven through a vendor SDK. Supports:
//! - Allied Vision cameras through the Vimba C API (`vimba` feature)
//! - A simulated camera with hardware-like frame rate limits for tests

pub mod features;
pub mod frame;
pub mod sim;

#[cfg(feature = "vimba")]
pub mod ffi;

pub use frame::{BufferPool, FrameInfo, FrameStatus, PixelFormat, ReceivedFrame};
pub use sim::{FeatureWrite, SimulatedCamera, SimulatedHandle, SimulatedModel, SimulatedSystem};

#[cfg(feature = "vimba")]
pub use ffi::{VimbaCamera, VimbaSystem};

use std::sync::Arc;
use thiserror::Error;

/// Device error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The device refused a feature write for its current configuration
    #[error("Feature {feature} rejected value: {reason}")]
    Rejected { feature: String, reason: String },

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Feature {0} has a different type")]
    WrongType(String),

    #[error("Device communication lost: {0}")]
    CommunicationLost(String),

    #[error("Camera not found: {0}")]
    NotFound(String),

    #[error("Invalid or closed device handle")]
    InvalidHandle,

    #[error("SDK call {call} failed with code {code}")]
    Sdk { call: &'static str, code: i32 },
}

impl DeviceError {
    /// Build a rejection for `feature`
    pub fn rejected(feature: &str, reason: impl Into<String>) -> Self {
        DeviceError::Rejected {
            feature: feature.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a value rejection rather than a device failure
    pub fn is_rejection(&self) -> bool {
        matches!(self, DeviceError::Rejected { .. })
    }
}

/// Camera discovered during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    /// SDK identifier used to open the camera
    pub id: String,
    pub name: String,
    pub model: String,
    pub serial: String,
}

/// Access mode requested when opening a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read and write access, required for acquisition
    Full,
    /// Read-only access
    Read,
}

/// Named, typed, hardware-backed feature values.
///
/// Reads always reflect current hardware state. Writes may be refused with
/// [`DeviceError::Rejected`] when the value is out of range for the current
/// configuration.
pub trait FeatureSet {
    fn float(&self, name: &str) -> Result<f64, DeviceError>;
    fn set_float(&self, name: &str, value: f64) -> Result<(), DeviceError>;
    fn int(&self, name: &str) -> Result<i64, DeviceError>;
    fn set_int(&self, name: &str, value: i64) -> Result<(), DeviceError>;
    fn enumeration(&self, name: &str) -> Result<String, DeviceError>;
    fn set_enumeration(&self, name: &str, value: &str) -> Result<(), DeviceError>;
    fn run_command(&self, name: &str) -> Result<(), DeviceError>;
}

/// Frame-ready callback, invoked on the driver's own thread
pub type FrameHandler = Arc<dyn Fn(ReceivedFrame<'_>) + Send + Sync>;

/// An open camera handle
pub trait Camera: FeatureSet + Send + Sync {
    /// SDK identifier of the camera
    fn id(&self) -> &str;

    /// Announce `buffer_count` buffers and start delivering frames to `handler`.
    ///
    /// The handler stays registered until
    /// [`stop_continuous_acquisition`](Camera::stop_continuous_acquisition)
    /// returns.
    fn start_continuous_acquisition(
        &self,
        buffer_count: usize,
        handler: FrameHandler,
    ) -> Result<(), DeviceError>;

    /// Stop delivery, flush queued buffers and unregister the handler
    fn stop_continuous_acquisition(&self) -> Result<(), DeviceError>;

    /// Release the handle. Further feature access fails with `InvalidHandle`.
    fn close(&self) -> Result<(), DeviceError>;
}

/// The SDK runtime: enumeration and opening of cameras
pub trait CameraSystem: Send + Sync {
    type Camera: Camera + 'static;

    fn startup(&self) -> Result<(), DeviceError>;
    fn shutdown(&self);
    fn cameras(&self) -> Result<Vec<CameraInfo>, DeviceError>;
    fn open(&self, id: &str, mode: AccessMode) -> Result<Self::Camera, DeviceError>;
}
