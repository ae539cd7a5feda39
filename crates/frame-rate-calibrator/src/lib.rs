//! Frame Rate Calibrator
//!
//! Discovers a camera's real frame rate limits by probing the live device.
//! The advertised limit is optimistic; the device rejects frame rate writes
//! above what its exposure and readout timing actually allow, so a rejected
//! write marks the boundary of the search.

mod calibrator;
mod error;

pub use calibrator::{
    decrease_until_accepted, increase_until_rejected, measure_device_ceiling, measure_real_max,
    theoretical_max_frame_rate, CalibrationState, FrameRateCalibrator,
};
pub use error::CalibrationError;

/// Search constants
pub mod limits {
    /// No search probes beyond this rate (fps)
    pub const MAX_FRAME_RATE_FPS: f64 = 1000.0;
    /// Exposure used while measuring the device ceiling (µs)
    pub const CEILING_PROBE_EXPOSURE_US: f64 = 1000.0;
    /// First candidate of the ceiling search (fps)
    pub const CEILING_SEARCH_START_FPS: f64 = 30.0;
    /// Coarse step of the real maximum search (fps)
    pub const COARSE_STEP_FPS: f64 = 0.1;
    /// Fine step, and the precision of every calibrated rate (fps)
    pub const FINE_STEP_FPS: f64 = 0.01;
}
