//! Calibration Error Types

use camera_device::DeviceError;
use thiserror::Error;

/// Errors that abort a calibration.
///
/// A rejected frame rate write during the search is never one of these; it
/// only marks where the search turns around.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// Device failure other than a value rejection
    #[error("Device error during calibration: {0}")]
    Device(#[from] DeviceError),

    /// Exposure time that cannot bound a frame rate
    #[error("Exposure time {0} ms does not bound a frame rate")]
    InvalidExposure(f64),

    #[error("Search step must be positive, got {0}")]
    InvalidStep(f64),

    /// The device refused every rate down to zero
    #[error("Device accepted no frame rate above zero")]
    NoAcceptedRate,
}
