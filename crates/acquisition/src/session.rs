//! Acquisition Session
//!
//! One session owns the camera from open to close on a dedicated worker
//! thread:
//!
//! ```text
//! Closed -> Opening -> Calibrating -> Streaming -> Draining -> Closed
//! ```
//!
//! Every resource acquired on the way in is held by a guard, so the release
//! sequence (stop acquisition, close the camera, shut the runtime down,
//! release the capture lock) runs on cancellation, on error and on normal
//! exit alike.

use crate::bridge::FrameBridge;
use crate::config::DeviceWaitConfig;
use crate::data_frame::FrameGeometry;
use crate::parameters::{AcquisitionParameters, Pending, SharedParameters};
use crate::source::{SessionStats, StreamEvent};
use crate::{lock, CaptureConfig, CaptureError};
use camera_device::features::{
    ACQUISITION_FRAME_RATE, ACQUISITION_FRAME_RATE_MODE, BLACK_LEVEL, DEVICE_RESET, EXPOSURE_TIME,
    FRAME_RATE_MODE_BASIC, GAIN, GAMMA, HEIGHT, PIXEL_FORMAT, WIDTH,
};
use camera_device::{
    AccessMode, Camera, CameraSystem, FeatureSet, FrameHandler, PixelFormat, ReceivedFrame,
};
use frame_rate_calibrator::{CalibrationState, FrameRateCalibrator};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Calibrating,
    Streaming,
    Draining,
}

/// State that outlives a single session and is shared with the source
pub(crate) struct SessionContext {
    pub parameters: SharedParameters,
    pub state: Mutex<SessionState>,
    pub calibration: Mutex<Option<CalibrationState>>,
    pub stats: Arc<SessionStats>,
    /// Held for the whole open/stream/close block
    pub capture_lock: Mutex<()>,
    #[cfg(test)]
    pub transitions: Mutex<Vec<SessionState>>,
}

impl SessionContext {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            parameters: SharedParameters::new(AcquisitionParameters::from(config)),
            state: Mutex::new(SessionState::Closed),
            calibration: Mutex::new(None),
            stats: Arc::new(SessionStats::default()),
            capture_lock: Mutex::new(()),
            #[cfg(test)]
            transitions: Mutex::new(Vec::new()),
        }
    }
}

/// Output of the Calibrating state
pub(crate) struct Calibrated {
    pub calibrator: FrameRateCalibrator,
    pub geometry: FrameGeometry,
}

/// Frame rate to apply given the requested parameters and the real maximum
fn frame_rate_target(values: &AcquisitionParameters, real_max: f64) -> f64 {
    if values.use_max_frame_rate || values.frame_rate_fps <= 0.0 {
        real_max
    } else {
        values.frame_rate_fps.min(real_max)
    }
}

fn simple_field(values: &mut AcquisitionParameters, flag: Pending) -> &mut f64 {
    if flag == Pending::BLACK_LEVEL {
        &mut values.black_level
    } else if flag == Pending::GAIN {
        &mut values.gain
    } else {
        &mut values.gamma
    }
}

/// Hardware value of `feature` when `requested` is unset
fn or_hardware<C: FeatureSet + ?Sized>(
    camera: &C,
    feature: &str,
    requested: f64,
) -> Result<f64, CaptureError> {
    if requested > 0.0 {
        Ok(requested)
    } else {
        Ok(camera.float(feature)?)
    }
}

fn dimension<C: FeatureSet + ?Sized>(camera: &C, feature: &str) -> Result<u32, CaptureError> {
    let value = camera.int(feature)?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            CaptureError::ConfigurationInvalid(format!("{} of {} is not a usable size", feature, value))
        })
}

fn read_geometry<C: FeatureSet + ?Sized>(camera: &C) -> Result<FrameGeometry, CaptureError> {
    let width = dimension(camera, WIDTH)?;
    let height = dimension(camera, HEIGHT)?;
    let format = camera.enumeration(PIXEL_FORMAT)?;
    let pixel_format = PixelFormat::from_feature(&format).ok_or_else(|| {
        CaptureError::ConfigurationInvalid(format!("unsupported pixel format {}", format))
    })?;
    Ok(FrameGeometry {
        width,
        height,
        pixel_format,
    })
}

/// Poll enumeration until camera `id` is listed again.
///
/// The pause between polls starts at `initial_backoff_ms` and doubles up to
/// `max_backoff_ms`. Fails with `DeviceUnavailable` after `attempts` polls.
pub fn wait_for_device_online<S: CameraSystem + ?Sized>(
    system: &S,
    id: &str,
    wait: &DeviceWaitConfig,
) -> Result<(), CaptureError> {
    let mut backoff = Duration::from_millis(wait.initial_backoff_ms);
    let max_backoff = Duration::from_millis(wait.max_backoff_ms);

    for attempt in 1..=wait.attempts {
        match system.cameras() {
            Ok(cameras) if cameras.iter().any(|c| c.id == id) => {
                debug!("Camera {} online after {} polls", id, attempt);
                return Ok(());
            }
            Ok(_) => debug!("Camera {} not listed yet (poll {})", id, attempt),
            Err(e) => debug!("Enumeration failed while waiting for {}: {}", id, e),
        }
        if attempt < wait.attempts {
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    Err(CaptureError::DeviceUnavailable(format!(
        "{} did not come back online after {} polls",
        id, wait.attempts
    )))
}

/// Shuts the SDK runtime down when dropped
struct RuntimeGuard<'a, S: CameraSystem>(&'a S);

impl<S: CameraSystem> Drop for RuntimeGuard<'_, S> {
    fn drop(&mut self) {
        self.0.shutdown();
        debug!("Camera runtime shut down");
    }
}

/// Closes the camera handle when dropped
struct OpenCamera<C: Camera>(C);

impl<C: Camera> Deref for OpenCamera<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.0
    }
}

impl<C: Camera> Drop for OpenCamera<C> {
    fn drop(&mut self) {
        match self.0.close() {
            Ok(()) => debug!("Camera {} closed", self.0.id()),
            Err(e) => warn!("Failed to close camera {}: {}", self.0.id(), e),
        }
    }
}

/// Stops continuous acquisition when dropped
struct AcquisitionGuard<'a, C: Camera>(&'a C);

impl<C: Camera> Drop for AcquisitionGuard<'_, C> {
    fn drop(&mut self) {
        match self.0.stop_continuous_acquisition() {
            Ok(()) => debug!("Acquisition stopped on {}", self.0.id()),
            Err(e) => warn!("Failed to stop acquisition on {}: {}", self.0.id(), e),
        }
    }
}

/// One open-to-close run against a camera system
pub(crate) struct Session<S: CameraSystem> {
    system: Arc<S>,
    config: CaptureConfig,
    context: Arc<SessionContext>,
    cancel: Arc<AtomicBool>,
    sender: broadcast::Sender<StreamEvent>,
}

impl<S: CameraSystem> Session<S> {
    pub fn new(
        system: Arc<S>,
        config: CaptureConfig,
        context: Arc<SessionContext>,
        cancel: Arc<AtomicBool>,
        sender: broadcast::Sender<StreamEvent>,
    ) -> Self {
        Self {
            system,
            config,
            context,
            cancel,
            sender,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.context.state) = state;
        #[cfg(test)]
        lock(&self.context.transitions).push(state);
        debug!("Capture session {:?}", state);
    }

    /// Run the session until cancelled or failed. Blocks the calling thread.
    pub fn run(&self) -> Result<(), CaptureError> {
        let _capture = lock(&self.context.capture_lock);
        self.set_state(SessionState::Opening);
        if self.cancelled() {
            self.set_state(SessionState::Closed);
            return Ok(());
        }
        self.context.stats.record_session();

        let result = self.run_locked();
        self.set_state(SessionState::Closed);
        match &result {
            Ok(()) => info!("Capture session closed"),
            Err(e) => error!("Capture session failed: {}", e),
        }
        result
    }

    fn run_locked(&self) -> Result<(), CaptureError> {
        self.system.startup().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("camera runtime failed to start: {}", e))
        })?;
        let _runtime = RuntimeGuard(self.system.as_ref());
        let camera = self.open_camera()?;

        self.set_state(SessionState::Calibrating);
        let calibrated = self.calibrate(&*camera)?;
        if self.cancelled() {
            self.set_state(SessionState::Draining);
            return Ok(());
        }

        self.set_state(SessionState::Streaming);
        let bridge = FrameBridge::new(
            calibrated.geometry,
            self.sender.clone(),
            Arc::clone(&self.context.stats),
        );
        let handler: FrameHandler =
            Arc::new(move |frame: ReceivedFrame<'_>| bridge.on_frame(frame));
        camera.start_continuous_acquisition(self.config.buffer_count, handler)?;
        let acquisition = AcquisitionGuard(&*camera);
        info!(
            "Streaming from {} with {} buffers",
            camera.id(),
            self.config.buffer_count
        );

        let result = self.stream(&*camera, &calibrated.calibrator);
        self.set_state(SessionState::Draining);
        drop(acquisition);
        result
    }

    fn stream<C: FeatureSet + ?Sized>(
        &self,
        camera: &C,
        calibrator: &FrameRateCalibrator,
    ) -> Result<(), CaptureError> {
        let interval = self.config.reconcile_interval();
        while !self.cancelled() {
            self.reconcile(camera, calibrator)?;
            std::thread::sleep(interval);
        }
        debug!("Cancellation observed, leaving streaming loop");
        Ok(())
    }

    fn resolve_camera_id(&self) -> Result<String, CaptureError> {
        let cameras = self
            .system
            .cameras()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("enumeration failed: {}", e)))?;
        if cameras.is_empty() {
            return Err(CaptureError::DeviceUnavailable("no cameras found".to_string()));
        }
        let index = self.config.camera_index;
        cameras.get(index).map(|c| c.id.clone()).ok_or_else(|| {
            CaptureError::ConfigurationInvalid(format!(
                "camera index {} out of range, {} cameras found",
                index,
                cameras.len()
            ))
        })
    }

    fn open_by_id(&self, id: &str) -> Result<OpenCamera<S::Camera>, CaptureError> {
        let camera = self
            .system
            .open(id, AccessMode::Full)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", id, e)))?;
        info!("Opened camera {}", id);
        Ok(OpenCamera(camera))
    }

    fn open_camera(&self) -> Result<OpenCamera<S::Camera>, CaptureError> {
        let id = self.resolve_camera_id()?;
        let camera = self.open_by_id(&id)?;
        if !self.config.reset_on_open {
            return Ok(camera);
        }

        match camera.run_command(DEVICE_RESET) {
            Ok(()) => info!("Reset camera {}, waiting for it to return", id),
            Err(e) if e.is_rejection() => {
                warn!("Camera {} refused reset, continuing: {}", id, e);
                return Ok(camera);
            }
            Err(e) => return Err(e.into()),
        }
        drop(camera);

        wait_for_device_online(self.system.as_ref(), &id, &self.config.device_wait)?;
        self.open_by_id(&id)
    }

    /// Measure the device, resolve unset parameters from hardware and write
    /// the full parameter set.
    pub fn calibrate<C: FeatureSet + ?Sized>(&self, camera: &C) -> Result<Calibrated, CaptureError> {
        let parameters = &self.context.parameters;
        // Everything is written below
        parameters.take_pending();
        let requested = parameters.snapshot();

        camera.set_enumeration(ACQUISITION_FRAME_RATE_MODE, FRAME_RATE_MODE_BASIC)?;
        let calibrator = FrameRateCalibrator::measure(camera)?;

        let mut resolved = requested;
        resolved.exposure_time_ms = if requested.exposure_time_ms > 0.0 {
            requested.exposure_time_ms
        } else {
            camera.float(EXPOSURE_TIME)? / 1000.0
        };
        resolved.black_level = or_hardware(camera, BLACK_LEVEL, requested.black_level)?;
        resolved.gain = or_hardware(camera, GAIN, requested.gain)?;
        resolved.gamma = or_hardware(camera, GAMMA, requested.gamma)?;

        camera.set_float(EXPOSURE_TIME, resolved.exposure_time_ms * 1000.0)?;
        let calibration = calibrator.calibrate(camera, resolved.exposure_time_ms)?;
        resolved.frame_rate_fps = frame_rate_target(&requested, calibration.real_max);

        camera.set_float(ACQUISITION_FRAME_RATE, resolved.frame_rate_fps)?;
        camera.set_float(BLACK_LEVEL, resolved.black_level)?;
        camera.set_float(GAIN, resolved.gain)?;
        camera.set_float(GAMMA, resolved.gamma)?;
        parameters.store_applied(Pending::all(), &resolved);

        let geometry = read_geometry(camera)?;
        *lock(&self.context.calibration) = Some(calibration);

        info!(
            "Calibrated: ceiling {:.2} fps, theoretical {:.2} fps, real {:.2} fps at {} ms",
            calibration.device_ceiling,
            calibration.theoretical_max,
            calibration.real_max,
            resolved.exposure_time_ms
        );
        info!(
            "Frame geometry {}x{} {:?}",
            geometry.width, geometry.height, geometry.pixel_format
        );
        Ok(Calibrated {
            calibrator,
            geometry,
        })
    }

    /// One reconciliation pass.
    ///
    /// Flags of parameters that were not applied are put back before an
    /// error is returned.
    pub fn reconcile<C: FeatureSet + ?Sized>(
        &self,
        camera: &C,
        calibrator: &FrameRateCalibrator,
    ) -> Result<(), CaptureError> {
        let mut remaining = self.context.parameters.take_pending();
        if remaining.is_empty() {
            return Ok(());
        }
        let result = self.apply_pending(camera, calibrator, &mut remaining);
        if !remaining.is_empty() {
            self.context.parameters.restore_pending(remaining);
        }
        result
    }

    fn apply_pending<C: FeatureSet + ?Sized>(
        &self,
        camera: &C,
        calibrator: &FrameRateCalibrator,
        remaining: &mut Pending,
    ) -> Result<(), CaptureError> {
        let parameters = &self.context.parameters;
        let mut values = parameters.snapshot();

        // Exposure first: it moves the frame rate limits
        if remaining.contains(Pending::EXPOSURE_TIME) {
            if values.exposure_time_ms > 0.0 {
                camera.set_float(EXPOSURE_TIME, values.exposure_time_ms * 1000.0)?;
            } else {
                values.exposure_time_ms = camera.float(EXPOSURE_TIME)? / 1000.0;
            }
            parameters.store_applied(Pending::EXPOSURE_TIME, &values);
            remaining.remove(Pending::EXPOSURE_TIME);
            remaining.insert(Pending::FRAME_RATE);
            debug!("Applied exposure time {} ms", values.exposure_time_ms);
        }

        if remaining.contains(Pending::FRAME_RATE) {
            let calibration = calibrator.calibrate(camera, values.exposure_time_ms)?;
            values.frame_rate_fps = frame_rate_target(&values, calibration.real_max);
            camera.set_float(ACQUISITION_FRAME_RATE, values.frame_rate_fps)?;
            parameters.store_applied(Pending::FRAME_RATE, &values);
            remaining.remove(Pending::FRAME_RATE);
            *lock(&self.context.calibration) = Some(calibration);
            debug!(
                "Applied frame rate {:.2} fps (real max {:.2} fps)",
                values.frame_rate_fps, calibration.real_max
            );
        }

        let simple = [
            (Pending::BLACK_LEVEL, BLACK_LEVEL),
            (Pending::GAIN, GAIN),
            (Pending::GAMMA, GAMMA),
        ];
        for (flag, feature) in simple {
            if !remaining.contains(flag) {
                continue;
            }
            let value = simple_field(&mut values, flag);
            if *value > 0.0 {
                camera.set_float(feature, *value)?;
            } else {
                *value = camera.float(feature)?;
            }
            debug!("Applied {} {}", feature, value);
            parameters.store_applied(flag, &values);
            remaining.remove(flag);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_device::{SimulatedCamera, SimulatedHandle, SimulatedModel, SimulatedSystem};

    struct Harness {
        system: Arc<SimulatedSystem>,
        session: Session<SimulatedSystem>,
        handle: SimulatedHandle,
        calibrated: Calibrated,
    }

    impl Harness {
        fn calibrated(config: CaptureConfig) -> Self {
            let system = Arc::new(SimulatedSystem::single(SimulatedModel::default()));
            let context = Arc::new(SessionContext::new(&config));
            let (sender, _) = broadcast::channel(4);
            let session = Session::new(
                Arc::clone(&system),
                config,
                context,
                Arc::new(AtomicBool::new(false)),
                sender,
            );
            system.startup().unwrap();
            let handle = system.open("DEV_SIM0001", AccessMode::Full).unwrap();
            let calibrated = session.calibrate(&handle).unwrap();
            Self {
                system,
                session,
                handle,
                calibrated,
            }
        }

        fn camera(&self) -> &SimulatedCamera {
            self.system.camera(0).unwrap()
        }

        fn parameters(&self) -> &SharedParameters {
            &self.session.context.parameters
        }

        fn calibration(&self) -> CalibrationState {
            lock(&self.session.context.calibration).unwrap()
        }

        fn reconcile(&self) -> Result<(), CaptureError> {
            self.session.reconcile(&self.handle, &self.calibrated.calibrator)
        }
    }

    #[test]
    fn test_calibrate_resolves_unset_parameters() {
        let harness = Harness::calibrated(CaptureConfig::default());
        let values = harness.parameters().snapshot();
        let calibration = harness.calibration();

        assert_eq!(values.exposure_time_ms, 5.0);
        assert_eq!(values.black_level, 4.0);
        assert_eq!(values.gain, 2.5);
        assert_eq!(values.gamma, 1.0);
        assert_eq!(values.frame_rate_fps, calibration.real_max);
        assert_eq!(calibration.theoretical_max, 200.0);
        assert!(calibration.real_max <= calibration.theoretical_max);
        assert!(harness.parameters().pending().is_empty());

        assert_eq!(harness.camera().frame_rate_mode(), FRAME_RATE_MODE_BASIC);
        assert_eq!(harness.camera().frame_rate_fps(), values.frame_rate_fps);
        assert_eq!(
            harness.calibrated.geometry,
            FrameGeometry {
                width: 64,
                height: 48,
                pixel_format: PixelFormat::Mono8,
            }
        );
    }

    #[test]
    fn test_calibrate_keeps_requested_rate_below_real_max() {
        let harness = Harness::calibrated(CaptureConfig {
            frame_rate_fps: 25.0,
            exposure_time_ms: 8.0,
            ..Default::default()
        });
        assert_eq!(harness.parameters().snapshot().frame_rate_fps, 25.0);
        assert_eq!(harness.camera().exposure_us(), 8000.0);
        assert_eq!(harness.camera().frame_rate_fps(), 25.0);
    }

    #[test]
    fn test_exposure_applied_before_frame_rate() {
        let harness = Harness::calibrated(CaptureConfig::default());
        harness.camera().clear_writes();

        harness.parameters().set_exposure_time_ms(10.0);
        harness.reconcile().unwrap();

        let writes = harness.camera().float_writes();
        let exposure = writes
            .iter()
            .position(|w| w.feature == EXPOSURE_TIME)
            .unwrap();
        let first_rate = writes
            .iter()
            .position(|w| w.feature == ACQUISITION_FRAME_RATE)
            .unwrap();
        assert!(exposure < first_rate);
        assert_eq!(writes[exposure].value, 10_000.0);
        assert_eq!(
            writes.iter().filter(|w| w.feature == EXPOSURE_TIME).count(),
            1
        );

        let values = harness.parameters().snapshot();
        let calibration = harness.calibration();
        assert_eq!(calibration.theoretical_max, 100.0);
        assert_eq!(values.frame_rate_fps, calibration.real_max);
        assert_eq!(harness.camera().frame_rate_fps(), values.frame_rate_fps);
        let last_rate = writes
            .iter()
            .rev()
            .find(|w| w.feature == ACQUISITION_FRAME_RATE)
            .unwrap();
        assert!(last_rate.accepted);
        assert_eq!(last_rate.value, values.frame_rate_fps);
        assert!(harness.parameters().pending().is_empty());
    }

    #[test]
    fn test_requested_rate_above_real_max_is_clamped() {
        let harness = Harness::calibrated(CaptureConfig::default());
        harness.parameters().set_frame_rate_fps(999.0);
        harness.reconcile().unwrap();

        let real_max = harness.calibration().real_max;
        assert_eq!(harness.parameters().snapshot().frame_rate_fps, real_max);
        assert!(harness.parameters().pending().is_empty());
    }

    #[test]
    fn test_use_max_tracks_real_max() {
        let harness = Harness::calibrated(CaptureConfig {
            frame_rate_fps: 20.0,
            ..Default::default()
        });
        assert_eq!(harness.parameters().snapshot().frame_rate_fps, 20.0);

        harness.parameters().set_use_max_frame_rate(true);
        harness.reconcile().unwrap();
        let real_max = harness.calibration().real_max;
        assert_eq!(harness.parameters().snapshot().frame_rate_fps, real_max);

        // Requests are ignored while tracking the maximum
        harness.parameters().set_frame_rate_fps(10.0);
        harness.reconcile().unwrap();
        assert_eq!(harness.parameters().snapshot().frame_rate_fps, real_max);
    }

    #[test]
    fn test_simple_parameters_are_written() {
        let harness = Harness::calibrated(CaptureConfig::default());
        harness.camera().clear_writes();

        harness.parameters().set_gain(6.0);
        harness.parameters().set_gamma(1.8);
        harness.parameters().set_black_level(10.0);
        harness.reconcile().unwrap();

        let features: Vec<String> = harness
            .camera()
            .float_writes()
            .into_iter()
            .map(|w| w.feature)
            .collect();
        assert_eq!(features, vec![BLACK_LEVEL, GAIN, GAMMA]);
        assert_eq!(harness.handle.float(GAIN).unwrap(), 6.0);
        assert!(harness.parameters().pending().is_empty());
    }

    #[test]
    fn test_rejected_write_is_surfaced_and_kept_pending() {
        let harness = Harness::calibrated(CaptureConfig::default());
        harness.parameters().set_gain(40.0);
        harness.parameters().set_gamma(1.5);

        let err = harness.reconcile().unwrap_err();
        assert!(matches!(err, CaptureError::FeatureRejected { ref feature, .. } if feature == GAIN));
        assert_eq!(harness.parameters().pending(), Pending::GAIN | Pending::GAMMA);
    }

    #[test]
    fn test_disconnect_during_reconcile_is_fatal() {
        let harness = Harness::calibrated(CaptureConfig::default());
        harness.camera().disconnect();
        harness.parameters().set_exposure_time_ms(7.0);

        let err = harness.reconcile().unwrap_err();
        assert!(matches!(err, CaptureError::DeviceCommunicationLost(_)));
        assert!(harness.parameters().pending().contains(Pending::EXPOSURE_TIME));
    }

    #[test]
    fn test_idle_pass_touches_nothing() {
        let harness = Harness::calibrated(CaptureConfig::default());
        harness.camera().clear_writes();
        harness.reconcile().unwrap();
        assert!(harness.camera().float_writes().is_empty());
    }

    #[test]
    fn test_wait_for_device_online_is_bounded() {
        let system = SimulatedSystem::single(SimulatedModel::default());
        system.startup().unwrap();
        let camera = system.camera(0).unwrap();
        let wait = DeviceWaitConfig {
            attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };

        camera.features().run_command(DEVICE_RESET).unwrap();
        let err = wait_for_device_online(&system, "DEV_SIM0001", &wait).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));

        // Both polls above were spent while offline
        assert!(wait_for_device_online(&system, "DEV_SIM0001", &wait).is_ok());
    }

    #[test]
    fn test_unknown_pixel_format_is_invalid_configuration() {
        struct Bayer;

        impl FeatureSet for Bayer {
            fn float(&self, name: &str) -> Result<f64, camera_device::DeviceError> {
                Err(camera_device::DeviceError::FeatureNotFound(name.into()))
            }
            fn set_float(&self, name: &str, _: f64) -> Result<(), camera_device::DeviceError> {
                Err(camera_device::DeviceError::FeatureNotFound(name.into()))
            }
            fn int(&self, _: &str) -> Result<i64, camera_device::DeviceError> {
                Ok(16)
            }
            fn set_int(&self, name: &str, _: i64) -> Result<(), camera_device::DeviceError> {
                Err(camera_device::DeviceError::FeatureNotFound(name.into()))
            }
            fn enumeration(&self, _: &str) -> Result<String, camera_device::DeviceError> {
                Ok("BayerRG8".to_string())
            }
            fn set_enumeration(&self, name: &str, _: &str) -> Result<(), camera_device::DeviceError> {
                Err(camera_device::DeviceError::FeatureNotFound(name.into()))
            }
            fn run_command(&self, name: &str) -> Result<(), camera_device::DeviceError> {
                Err(camera_device::DeviceError::FeatureNotFound(name.into()))
            }
        }

        assert!(matches!(
            read_geometry(&Bayer),
            Err(CaptureError::ConfigurationInvalid(_))
        ));
    }

    /// Requests cancellation as soon as a camera is opened
    struct CancelOnOpen {
        inner: SimulatedSystem,
        cancel: Arc<AtomicBool>,
    }

    impl CameraSystem for CancelOnOpen {
        type Camera = SimulatedHandle;

        fn startup(&self) -> Result<(), camera_device::DeviceError> {
            self.inner.startup()
        }

        fn shutdown(&self) {
            self.inner.shutdown()
        }

        fn cameras(&self) -> Result<Vec<camera_device::CameraInfo>, camera_device::DeviceError> {
            self.inner.cameras()
        }

        fn open(&self, id: &str, mode: AccessMode) -> Result<SimulatedHandle, camera_device::DeviceError> {
            self.cancel.store(true, Ordering::SeqCst);
            self.inner.open(id, mode)
        }
    }

    #[test]
    fn test_cancel_during_calibration_drains_before_close() {
        let cancel = Arc::new(AtomicBool::new(false));
        let system = Arc::new(CancelOnOpen {
            inner: SimulatedSystem::single(SimulatedModel::default()),
            cancel: Arc::clone(&cancel),
        });
        let config = CaptureConfig::default();
        let context = Arc::new(SessionContext::new(&config));
        let (sender, _) = broadcast::channel(4);
        let session = Session::new(Arc::clone(&system), config, Arc::clone(&context), cancel, sender);

        session.run().unwrap();

        assert_eq!(
            *lock(&context.transitions),
            vec![
                SessionState::Opening,
                SessionState::Calibrating,
                SessionState::Draining,
                SessionState::Closed,
            ]
        );
        let camera = system.inner.camera(0).unwrap();
        assert_eq!(camera.open_handles(), 0);
        assert_eq!(camera.frames_delivered(), 0);
        assert!(!system.inner.runtime_active());
    }
}
