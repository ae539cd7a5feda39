//! Capture Error Types

use camera_device::DeviceError;
use frame_rate_calibrator::CalibrationError;
use thiserror::Error;

/// Errors that end a capture session.
///
/// `Clone` so the terminal error can reach every subscriber of a shared
/// session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// Enumeration or open failed
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device refused a parameter write outside calibration
    #[error("Feature {feature} rejected: {reason}")]
    FeatureRejected { feature: String, reason: String },

    #[error("Device communication lost: {0}")]
    DeviceCommunicationLost(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Calibration failed: {0}")]
    Calibration(CalibrationError),
}

impl From<DeviceError> for CaptureError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Rejected { feature, reason } => {
                CaptureError::FeatureRejected { feature, reason }
            }
            DeviceError::NotFound(id) => CaptureError::DeviceUnavailable(id),
            other => CaptureError::DeviceCommunicationLost(other.to_string()),
        }
    }
}

impl From<CalibrationError> for CaptureError {
    fn from(err: CalibrationError) -> Self {
        match err {
            CalibrationError::Device(device) => device.into(),
            other => CaptureError::Calibration(other),
        }
    }
}

impl From<::config::ConfigError> for CaptureError {
    fn from(err: ::config::ConfigError) -> Self {
        CaptureError::ConfigurationInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_map_to_taxonomy() {
        let rejected: CaptureError = DeviceError::rejected("Gain", "above 24").into();
        assert!(matches!(rejected, CaptureError::FeatureRejected { ref feature, .. } if feature == "Gain"));

        let lost: CaptureError = DeviceError::CommunicationLost("DEV_1".into()).into();
        assert!(matches!(lost, CaptureError::DeviceCommunicationLost(_)));

        let missing: CaptureError = DeviceError::NotFound("DEV_1".into()).into();
        assert_eq!(missing, CaptureError::DeviceUnavailable("DEV_1".into()));
    }

    #[test]
    fn test_calibration_device_failure_is_communication_loss() {
        let err: CaptureError =
            CalibrationError::Device(DeviceError::CommunicationLost("DEV_1".into())).into();
        assert!(matches!(err, CaptureError::DeviceCommunicationLost(_)));

        let err: CaptureError = CalibrationError::NoAcceptedRate.into();
        assert_eq!(err, CaptureError::Calibration(CalibrationError::NoAcceptedRate));
    }
}
