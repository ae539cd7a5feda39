//! Capture Configuration

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounded wait for a camera to re-enumerate after a reset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceWaitConfig {
    /// Enumeration polls before giving up
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for DeviceWaitConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

/// Configuration for a capture source.
///
/// Parameter values of zero mean "use what the hardware has" and are
/// resolved when the session calibrates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Position of the camera in the enumeration order
    pub camera_index: usize,
    pub exposure_time_ms: f64,
    pub frame_rate_fps: f64,
    pub black_level: f64,
    pub gain: f64,
    pub gamma: f64,
    /// Track the calibrated real maximum instead of `frame_rate_fps`
    pub use_max_frame_rate: bool,
    /// Device buffers announced for continuous acquisition
    pub buffer_count: usize,
    /// Sleep between reconciliation passes
    pub reconcile_interval_ms: u64,
    /// Frames buffered per subscriber before it starts skipping
    pub channel_capacity: usize,
    /// Issue `DeviceReset` after opening and wait for the camera to return
    pub reset_on_open: bool,
    pub device_wait: DeviceWaitConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            exposure_time_ms: 0.0,
            frame_rate_fps: 0.0,
            black_level: 0.0,
            gain: 0.0,
            gamma: 0.0,
            use_max_frame_rate: false,
            buffer_count: 3,
            reconcile_interval_ms: 1,
            channel_capacity: 16,
            reset_on_open: false,
            device_wait: DeviceWaitConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Load from an optional file at `path` overlaid with `CAPTURE__*`
    /// environment variables (`CAPTURE__DEVICE_WAIT__ATTEMPTS` for nested keys)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let config: CaptureConfig = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()).required(false))
            .add_source(
                ::config::Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let parameters = [
            ("exposure_time_ms", self.exposure_time_ms),
            ("frame_rate_fps", self.frame_rate_fps),
            ("black_level", self.black_level),
            ("gain", self.gain),
            ("gamma", self.gamma),
        ];
        for (name, value) in parameters {
            if !value.is_finite() || value < 0.0 {
                return Err(CaptureError::ConfigurationInvalid(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.buffer_count == 0 {
            return Err(CaptureError::ConfigurationInvalid(
                "buffer_count must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(CaptureError::ConfigurationInvalid(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.device_wait.attempts == 0 {
            return Err(CaptureError::ConfigurationInvalid(
                "device_wait.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}
