//! Bracketing Search Implementation
//!
//! Each search walks a candidate rate in fixed steps and writes it to the
//! `AcquisitionFrameRate` feature, turning around at the first rejected
//! (increasing) or accepted (decreasing) write. Chaining passes at shrinking
//! step sizes brackets the boundary to 0.01 fps without a linear scan at
//! that granularity.

use crate::limits::{
    CEILING_PROBE_EXPOSURE_US, CEILING_SEARCH_START_FPS, COARSE_STEP_FPS, FINE_STEP_FPS,
    MAX_FRAME_RATE_FPS,
};
use crate::CalibrationError;
use camera_device::features::{ACQUISITION_FRAME_RATE, EXPOSURE_TIME};
use camera_device::FeatureSet;
use tracing::{debug, info, warn};

/// Round to the 0.01 fps grid the search moves on
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn check_step(step: f64) -> Result<(), CalibrationError> {
    if step.is_finite() && step > 0.0 {
        Ok(())
    } else {
        Err(CalibrationError::InvalidStep(step))
    }
}

/// Rate implied by exposure time alone, capped by the device ceiling.
///
/// `min(1000 / exposure_ms, ceiling)`. Undefined for a zero exposure, which
/// must be resolved to a concrete value first.
pub fn theoretical_max_frame_rate(exposure_ms: f64, ceiling: f64) -> Result<f64, CalibrationError> {
    if !(exposure_ms.is_finite() && exposure_ms > 0.0) {
        return Err(CalibrationError::InvalidExposure(exposure_ms));
    }
    Ok((1000.0 / exposure_ms).min(ceiling))
}

/// Step the rate up from `start` until the device rejects it.
///
/// Returns the first rejected candidate, one step past the last accepted
/// value, or [`MAX_FRAME_RATE_FPS`] if the search reaches it.
pub fn increase_until_rejected<F: FeatureSet + ?Sized>(
    features: &F,
    step: f64,
    start: f64,
) -> Result<f64, CalibrationError> {
    check_step(step)?;
    let mut candidate = start;
    loop {
        candidate = round2(candidate + step);
        if candidate >= MAX_FRAME_RATE_FPS {
            return Ok(MAX_FRAME_RATE_FPS);
        }
        match features.set_float(ACQUISITION_FRAME_RATE, candidate) {
            Ok(()) => {}
            Err(e) if e.is_rejection() => return Ok(candidate),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Step the rate down from `start` until the device accepts it.
///
/// Returns the first accepted candidate, or `0.0` if none above zero is.
pub fn decrease_until_accepted<F: FeatureSet + ?Sized>(
    features: &F,
    step: f64,
    start: f64,
) -> Result<f64, CalibrationError> {
    check_step(step)?;
    let mut candidate = start;
    loop {
        candidate = round2(candidate - step);
        if candidate <= 0.0 {
            return Ok(0.0);
        }
        match features.set_float(ACQUISITION_FRAME_RATE, candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.is_rejection() => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Real achievable maximum frame rate at the current exposure.
///
/// Drops from `theoretical_max` in 0.1 fps steps into the accepted region,
/// then climbs in 0.01 fps steps to the boundary. Exposure is left alone;
/// the frame rate is restored afterwards, capped at the measured maximum.
pub fn measure_real_max<F: FeatureSet + ?Sized>(
    features: &F,
    theoretical_max: f64,
) -> Result<f64, CalibrationError> {
    let original = features.float(ACQUISITION_FRAME_RATE)?;

    // May bottom out at zero below 0.1 fps; the fine pass climbs from there
    let accepted = decrease_until_accepted(features, COARSE_STEP_FPS, theoretical_max)?;
    let rejected = increase_until_rejected(features, FINE_STEP_FPS, accepted)?;
    let real_max = round2(rejected - FINE_STEP_FPS).min(theoretical_max);
    if real_max <= 0.0 {
        return Err(CalibrationError::NoAcceptedRate);
    }

    restore_frame_rate(features, original.min(real_max))?;

    debug!(
        "Real max frame rate {:.2} fps (theoretical {:.2} fps)",
        real_max, theoretical_max
    );
    Ok(real_max)
}

/// Absolute frame rate ceiling of the device.
///
/// Exposure is forced to a minimal value so readout is the only limit, then
/// four passes at 10, 1, 0.1 and 0.01 fps bracket the ceiling. Exposure and
/// frame rate are restored before returning, also when the search fails.
pub fn measure_device_ceiling<F: FeatureSet + ?Sized>(features: &F) -> Result<f64, CalibrationError> {
    let exposure = features.float(EXPOSURE_TIME)?;
    let rate = features.float(ACQUISITION_FRAME_RATE)?;

    features.set_float(EXPOSURE_TIME, CEILING_PROBE_EXPOSURE_US)?;
    let search = bracket_ceiling(features);

    // Rate first: it was valid at the original exposure and the probe
    // exposure is shorter, so it is valid now
    let restore_rate = match &search {
        Ok(ceiling) => rate.min(*ceiling),
        Err(_) => rate,
    };
    let restored = restore_frame_rate(features, restore_rate)
        .and_then(|_| features.set_float(EXPOSURE_TIME, exposure).map_err(Into::into));

    let ceiling = search?;
    restored?;

    info!("Device frame rate ceiling {:.2} fps", ceiling);
    Ok(ceiling)
}

fn bracket_ceiling<F: FeatureSet + ?Sized>(features: &F) -> Result<f64, CalibrationError> {
    let rate = increase_until_rejected(features, 10.0, CEILING_SEARCH_START_FPS)?;
    let rate = decrease_until_accepted(features, 1.0, rate)?;
    let rate = increase_until_rejected(features, 0.1, rate)?;
    let rate = decrease_until_accepted(features, FINE_STEP_FPS, rate)?;
    if rate <= 0.0 {
        return Err(CalibrationError::NoAcceptedRate);
    }
    Ok(rate)
}

fn restore_frame_rate<F: FeatureSet + ?Sized>(features: &F, rate: f64) -> Result<(), CalibrationError> {
    match features.set_float(ACQUISITION_FRAME_RATE, rate) {
        Ok(()) => Ok(()),
        Err(e) if e.is_rejection() => {
            warn!("Could not restore frame rate {:.2} fps: {}", rate, e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Frame rate limits derived for one exposure time
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationState {
    /// Absolute ceiling, measured once per session at minimal exposure
    pub device_ceiling: f64,
    /// `min(1000 / exposure_ms, device_ceiling)`
    pub theoretical_max: f64,
    /// Empirically confirmed maximum at the exposure
    pub real_max: f64,
}

/// Calibrator bound to a measured device ceiling
#[derive(Debug, Clone, Copy)]
pub struct FrameRateCalibrator {
    device_ceiling: f64,
}

impl FrameRateCalibrator {
    /// Measure the device ceiling and keep it for later calibrations
    pub fn measure<F: FeatureSet + ?Sized>(features: &F) -> Result<Self, CalibrationError> {
        Ok(Self {
            device_ceiling: measure_device_ceiling(features)?,
        })
    }

    /// Use a ceiling measured earlier
    pub fn with_ceiling(device_ceiling: f64) -> Self {
        Self { device_ceiling }
    }

    pub fn device_ceiling(&self) -> f64 {
        self.device_ceiling
    }

    /// Theoretical and real maximum for `exposure_ms`
    pub fn calibrate<F: FeatureSet + ?Sized>(
        &self,
        features: &F,
        exposure_ms: f64,
    ) -> Result<CalibrationState, CalibrationError> {
        let theoretical_max = theoretical_max_frame_rate(exposure_ms, self.device_ceiling)?;
        let real_max = measure_real_max(features, theoretical_max)?;
        Ok(CalibrationState {
            device_ceiling: self.device_ceiling,
            theoretical_max,
            real_max,
        })
    }
}
