//! Simulated camera for tests and hardware-free runs
//!
//! Models the behaviour acquisition depends on: frame rate writes are
//! rejected above the real readout limit for the current exposure, which
//! sits below the advertised `1e6 / exposure_us` bound. Counters for open
//! handles, runtime start/shutdown and buffer returns make resource leaks
//! observable.

use crate::features;
use crate::frame::{BufferPool, FrameInfo, FrameStatus, PixelFormat, ReceivedFrame};
use crate::{AccessMode, Camera, CameraInfo, CameraSystem, DeviceError, FeatureSet, FrameHandler};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Slack allowed when comparing a requested rate against the limit
const RATE_TOLERANCE: f64 = 1e-9;

/// Vimba `VmbErrorInvalidCall`
const INVALID_CALL: i32 = -15;

/// Static description of a simulated camera
#[derive(Debug, Clone)]
pub struct SimulatedModel {
    pub id: String,
    pub name: String,
    /// Absolute frame rate ceiling of the sensor (fps)
    pub ceiling_fps: f64,
    /// Readout time added to every exposure (µs)
    pub readout_overhead_us: f64,
    pub min_exposure_us: f64,
    pub max_exposure_us: f64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Power-on exposure time (µs)
    pub exposure_us: f64,
    /// Power-on frame rate (fps)
    pub frame_rate_fps: f64,
    pub black_level: f64,
    pub gain: f64,
    pub gamma: f64,
    /// Deliver every Nth frame with an incomplete status
    pub incomplete_every: Option<u64>,
    /// Enumeration calls that miss the camera after a `DeviceReset`
    pub reset_offline_polls: u32,
    /// Refuse `DeviceReset` as a rejected write
    pub reject_reset: bool,
}

impl Default for SimulatedModel {
    fn default() -> Self {
        Self {
            id: "DEV_SIM0001".to_string(),
            name: "Simulated Alvium".to_string(),
            ceiling_fps: 212.53,
            readout_overhead_us: 350.0,
            min_exposure_us: 20.0,
            max_exposure_us: 10_000_000.0,
            width: 64,
            height: 48,
            pixel_format: PixelFormat::Mono8,
            exposure_us: 5000.0,
            frame_rate_fps: 30.0,
            black_level: 4.0,
            gain: 2.5,
            gamma: 1.0,
            incomplete_every: None,
            reset_offline_polls: 2,
            reject_reset: false,
        }
    }
}

impl SimulatedModel {
    /// Highest frame rate the sensor actually sustains at `exposure_us`
    pub fn limit_fps(&self, exposure_us: f64) -> f64 {
        (1e6 / (exposure_us + self.readout_overhead_us)).min(self.ceiling_fps)
    }
}

/// A float feature write seen by the simulated device
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWrite {
    pub feature: String,
    pub value: f64,
    pub accepted: bool,
}

struct FeatureState {
    exposure_us: f64,
    frame_rate_fps: f64,
    black_level: f64,
    gain: f64,
    gamma: f64,
    frame_rate_mode: String,
    pixel_format: PixelFormat,
    offline_polls: u32,
}

impl FeatureState {
    fn power_on(model: &SimulatedModel) -> Self {
        Self {
            exposure_us: model.exposure_us,
            frame_rate_fps: model.frame_rate_fps,
            black_level: model.black_level,
            gain: model.gain,
            gamma: model.gamma,
            frame_rate_mode: "Off".to_string(),
            pixel_format: model.pixel_format,
            offline_polls: 0,
        }
    }
}

struct Acquisition {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Device {
    model: SimulatedModel,
    state: Mutex<FeatureState>,
    connected: AtomicBool,
    open_handles: AtomicUsize,
    total_opens: AtomicUsize,
    frames_delivered: AtomicU64,
    buffers_requeued: AtomicU64,
    double_requeues: AtomicU64,
    writes: Mutex<Vec<FeatureWrite>>,
    acquisition: Mutex<Option<Acquisition>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_range(feature: &str, value: f64, min: f64, max: f64) -> Result<(), DeviceError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(DeviceError::rejected(
            feature,
            format!("{} outside [{}, {}]", value, min, max),
        ))
    }
}

impl Device {
    fn check_connected(&self) -> Result<(), DeviceError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::CommunicationLost(self.model.id.clone()))
        }
    }

    fn payload_size(&self) -> usize {
        let format = lock(&self.state).pixel_format;
        self.model.width as usize * self.model.height as usize * format.bytes_per_pixel()
    }

    fn frame_period(&self) -> Duration {
        let rate = lock(&self.state).frame_rate_fps;
        Duration::from_secs_f64(1.0 / rate.max(1.0))
    }

    fn float(&self, name: &str) -> Result<f64, DeviceError> {
        self.check_connected()?;
        let state = lock(&self.state);
        match name {
            features::EXPOSURE_TIME => Ok(state.exposure_us),
            features::ACQUISITION_FRAME_RATE => Ok(state.frame_rate_fps),
            features::BLACK_LEVEL => Ok(state.black_level),
            features::GAIN => Ok(state.gain),
            features::GAMMA => Ok(state.gamma),
            features::WIDTH | features::HEIGHT | features::PAYLOAD_SIZE => {
                Err(DeviceError::WrongType(name.to_string()))
            }
            _ => Err(DeviceError::FeatureNotFound(name.to_string())),
        }
    }

    fn set_float(&self, name: &str, value: f64) -> Result<(), DeviceError> {
        self.check_connected()?;
        let mut state = lock(&self.state);
        let result = match name {
            features::EXPOSURE_TIME => {
                check_range(name, value, self.model.min_exposure_us, self.model.max_exposure_us)
                    .map(|_| {
                        state.exposure_us = value;
                        // A longer exposure pulls the running frame rate down with it
                        let limit = self.model.limit_fps(value);
                        if state.frame_rate_fps > limit {
                            state.frame_rate_fps = (limit * 100.0).floor() / 100.0;
                        }
                    })
            }
            features::ACQUISITION_FRAME_RATE => {
                let limit = self.model.limit_fps(state.exposure_us);
                if value.is_finite() && value > 0.0 && value <= limit + RATE_TOLERANCE {
                    state.frame_rate_fps = value;
                    Ok(())
                } else {
                    Err(DeviceError::rejected(
                        name,
                        format!("{} exceeds {:.4} at current exposure", value, limit),
                    ))
                }
            }
            features::BLACK_LEVEL => {
                check_range(name, value, 0.0, 255.0).map(|_| state.black_level = value)
            }
            features::GAIN => check_range(name, value, 0.0, 24.0).map(|_| state.gain = value),
            features::GAMMA => check_range(name, value, 0.4, 2.4).map(|_| state.gamma = value),
            features::WIDTH | features::HEIGHT | features::PAYLOAD_SIZE => {
                return Err(DeviceError::WrongType(name.to_string()))
            }
            _ => return Err(DeviceError::FeatureNotFound(name.to_string())),
        };
        drop(state);

        lock(&self.writes).push(FeatureWrite {
            feature: name.to_string(),
            value,
            accepted: result.is_ok(),
        });
        result
    }

    fn int(&self, name: &str) -> Result<i64, DeviceError> {
        self.check_connected()?;
        match name {
            features::WIDTH => Ok(i64::from(self.model.width)),
            features::HEIGHT => Ok(i64::from(self.model.height)),
            features::PAYLOAD_SIZE => Ok(self.payload_size() as i64),
            features::EXPOSURE_TIME
            | features::ACQUISITION_FRAME_RATE
            | features::BLACK_LEVEL
            | features::GAIN
            | features::GAMMA => Err(DeviceError::WrongType(name.to_string())),
            _ => Err(DeviceError::FeatureNotFound(name.to_string())),
        }
    }

    fn set_int(&self, name: &str, value: i64) -> Result<(), DeviceError> {
        self.check_connected()?;
        match name {
            features::WIDTH | features::HEIGHT | features::PAYLOAD_SIZE => Err(
                DeviceError::rejected(name, format!("{} is fixed for this sensor", value)),
            ),
            _ => Err(DeviceError::FeatureNotFound(name.to_string())),
        }
    }

    fn enumeration(&self, name: &str) -> Result<String, DeviceError> {
        self.check_connected()?;
        let state = lock(&self.state);
        match name {
            features::PIXEL_FORMAT => Ok(state.pixel_format.feature_name().to_string()),
            features::ACQUISITION_FRAME_RATE_MODE => Ok(state.frame_rate_mode.clone()),
            _ => Err(DeviceError::FeatureNotFound(name.to_string())),
        }
    }

    fn set_enumeration(&self, name: &str, value: &str) -> Result<(), DeviceError> {
        self.check_connected()?;
        let acquiring = lock(&self.acquisition).is_some();
        let mut state = lock(&self.state);
        match name {
            features::PIXEL_FORMAT => match PixelFormat::from_feature(value) {
                Some(_) if acquiring => Err(DeviceError::rejected(name, "locked while acquiring")),
                Some(format) => {
                    state.pixel_format = format;
                    Ok(())
                }
                None => Err(DeviceError::rejected(name, format!("unsupported {}", value))),
            },
            features::ACQUISITION_FRAME_RATE_MODE => match value {
                features::FRAME_RATE_MODE_BASIC | "Off" => {
                    state.frame_rate_mode = value.to_string();
                    Ok(())
                }
                _ => Err(DeviceError::rejected(name, format!("unsupported {}", value))),
            },
            _ => Err(DeviceError::FeatureNotFound(name.to_string())),
        }
    }

    fn run_command(&self, name: &str) -> Result<(), DeviceError> {
        self.check_connected()?;
        match name {
            features::DEVICE_RESET if self.model.reject_reset => {
                Err(DeviceError::rejected(name, "reset not permitted"))
            }
            features::DEVICE_RESET => {
                info!("Simulated camera {} resetting", self.model.id);
                let mut state = lock(&self.state);
                *state = FeatureState::power_on(&self.model);
                state.offline_polls = self.model.reset_offline_polls;
                Ok(())
            }
            features::ACQUISITION_START | features::ACQUISITION_STOP => Ok(()),
            _ => Err(DeviceError::FeatureNotFound(name.to_string())),
        }
    }

    fn stop_acquisition(&self) -> Result<(), DeviceError> {
        let acquisition = lock(&self.acquisition).take();
        if let Some(acquisition) = acquisition {
            acquisition.running.store(false, Ordering::SeqCst);
            acquisition.thread.join().map_err(|_| DeviceError::Sdk {
                call: "VmbCaptureEnd",
                code: INVALID_CALL,
            })?;
            debug!("Simulated acquisition stopped on {}", self.model.id);
        }
        Ok(())
    }
}

/// Announced buffers of one simulated acquisition
struct SimulatedPool {
    queued: Vec<AtomicBool>,
    device: Arc<Device>,
}

impl SimulatedPool {
    fn take_queued(&self) -> Option<usize> {
        self.queued
            .iter()
            .position(|slot| {
                slot.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
    }
}

impl BufferPool for SimulatedPool {
    fn requeue(&self, slot: usize) -> Result<(), DeviceError> {
        let queued = self.queued.get(slot).ok_or(DeviceError::Sdk {
            call: "VmbCaptureFrameQueue",
            code: INVALID_CALL,
        })?;
        if queued.swap(true, Ordering::SeqCst) {
            self.device.double_requeues.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Sdk {
                call: "VmbCaptureFrameQueue",
                code: INVALID_CALL,
            });
        }
        self.device.buffers_requeued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fill_pattern(buffer: &mut [u8], format: PixelFormat, frame_id: u64) {
    match format {
        PixelFormat::Mono8 => {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (frame_id as usize + i) as u8;
            }
        }
        PixelFormat::Mono16 => {
            for (i, pixel) in buffer.chunks_exact_mut(2).enumerate() {
                let value = (frame_id as usize * 256 + i) as u16;
                pixel.copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

fn run_acquisition(
    device: Arc<Device>,
    pool: Arc<SimulatedPool>,
    handler: FrameHandler,
    running: Arc<AtomicBool>,
) {
    let payload = device.payload_size();
    let format = lock(&device.state).pixel_format;
    let mut buffers = vec![vec![0u8; payload]; pool.queued.len()];
    let mut frame_id = 0u64;
    let clock = Instant::now();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(device.frame_period());
        if !running.load(Ordering::SeqCst) || !device.connected.load(Ordering::SeqCst) {
            continue;
        }

        let Some(slot) = pool.take_queued() else {
            debug!("Simulated camera {} starved of buffers", device.model.id);
            continue;
        };

        frame_id += 1;
        fill_pattern(&mut buffers[slot], format, frame_id);

        let status = match device.model.incomplete_every {
            Some(n) if n > 0 && frame_id % n == 0 => FrameStatus::Incomplete,
            _ => FrameStatus::Complete,
        };
        let info = FrameInfo {
            frame_id,
            width: device.model.width,
            height: device.model.height,
            device_timestamp: clock.elapsed().as_nanos() as u64,
            status,
        };

        device.frames_delivered.fetch_add(1, Ordering::SeqCst);
        handler(ReceivedFrame::new(info, &buffers[slot], slot, pool.as_ref()));
    }
}

/// Test-facing view of a simulated camera. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedCamera {
    device: Arc<Device>,
}

impl SimulatedCamera {
    pub fn new(model: SimulatedModel) -> Self {
        let state = FeatureState::power_on(&model);
        Self {
            device: Arc::new(Device {
                model,
                state: Mutex::new(state),
                connected: AtomicBool::new(true),
                open_handles: AtomicUsize::new(0),
                total_opens: AtomicUsize::new(0),
                frames_delivered: AtomicU64::new(0),
                buffers_requeued: AtomicU64::new(0),
                double_requeues: AtomicU64::new(0),
                writes: Mutex::new(Vec::new()),
                acquisition: Mutex::new(None),
            }),
        }
    }

    pub fn model(&self) -> &SimulatedModel {
        &self.device.model
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            id: self.device.model.id.clone(),
            name: self.device.model.name.clone(),
            model: "SIM-1800".to_string(),
            serial: self.device.model.id.trim_start_matches("DEV_").to_string(),
        }
    }

    /// Handles currently open on this camera
    pub fn open_handles(&self) -> usize {
        self.device.open_handles.load(Ordering::SeqCst)
    }

    pub fn total_opens(&self) -> usize {
        self.device.total_opens.load(Ordering::SeqCst)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.device.frames_delivered.load(Ordering::SeqCst)
    }

    pub fn buffers_requeued(&self) -> u64 {
        self.device.buffers_requeued.load(Ordering::SeqCst)
    }

    /// Buffers returned while already queued
    pub fn double_requeues(&self) -> u64 {
        self.device.double_requeues.load(Ordering::SeqCst)
    }

    pub fn is_acquiring(&self) -> bool {
        lock(&self.device.acquisition).is_some()
    }

    /// Real frame rate limit at the current exposure
    pub fn limit_fps(&self) -> f64 {
        let exposure = lock(&self.device.state).exposure_us;
        self.device.model.limit_fps(exposure)
    }

    pub fn exposure_us(&self) -> f64 {
        lock(&self.device.state).exposure_us
    }

    pub fn frame_rate_fps(&self) -> f64 {
        lock(&self.device.state).frame_rate_fps
    }

    pub fn frame_rate_mode(&self) -> String {
        lock(&self.device.state).frame_rate_mode.clone()
    }

    /// Float feature writes in the order they were attempted
    pub fn float_writes(&self) -> Vec<FeatureWrite> {
        lock(&self.device.writes).clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.device.writes).clear();
    }

    /// Simulate the cable being pulled
    pub fn disconnect(&self) {
        info!("Simulated camera {} disconnected", self.device.model.id);
        self.device.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.device.connected.store(true, Ordering::SeqCst);
    }

    /// Feature access without opening a handle
    pub fn features(&self) -> &dyn FeatureSet {
        self
    }
}

impl FeatureSet for SimulatedCamera {
    fn float(&self, name: &str) -> Result<f64, DeviceError> {
        self.device.float(name)
    }

    fn set_float(&self, name: &str, value: f64) -> Result<(), DeviceError> {
        self.device.set_float(name, value)
    }

    fn int(&self, name: &str) -> Result<i64, DeviceError> {
        self.device.int(name)
    }

    fn set_int(&self, name: &str, value: i64) -> Result<(), DeviceError> {
        self.device.set_int(name, value)
    }

    fn enumeration(&self, name: &str) -> Result<String, DeviceError> {
        self.device.enumeration(name)
    }

    fn set_enumeration(&self, name: &str, value: &str) -> Result<(), DeviceError> {
        self.device.set_enumeration(name, value)
    }

    fn run_command(&self, name: &str) -> Result<(), DeviceError> {
        self.device.run_command(name)
    }
}

/// An open handle on a simulated camera
pub struct SimulatedHandle {
    camera: SimulatedCamera,
    closed: AtomicBool,
}

impl SimulatedHandle {
    fn device(&self) -> Result<&Device, DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DeviceError::InvalidHandle)
        } else {
            Ok(&self.camera.device)
        }
    }
}

impl FeatureSet for SimulatedHandle {
    fn float(&self, name: &str) -> Result<f64, DeviceError> {
        self.device()?.float(name)
    }

    fn set_float(&self, name: &str, value: f64) -> Result<(), DeviceError> {
        self.device()?.set_float(name, value)
    }

    fn int(&self, name: &str) -> Result<i64, DeviceError> {
        self.device()?.int(name)
    }

    fn set_int(&self, name: &str, value: i64) -> Result<(), DeviceError> {
        self.device()?.set_int(name, value)
    }

    fn enumeration(&self, name: &str) -> Result<String, DeviceError> {
        self.device()?.enumeration(name)
    }

    fn set_enumeration(&self, name: &str, value: &str) -> Result<(), DeviceError> {
        self.device()?.set_enumeration(name, value)
    }

    fn run_command(&self, name: &str) -> Result<(), DeviceError> {
        self.device()?.run_command(name)
    }
}

impl Camera for SimulatedHandle {
    fn id(&self) -> &str {
        &self.camera.device.model.id
    }

    fn start_continuous_acquisition(
        &self,
        buffer_count: usize,
        handler: FrameHandler,
    ) -> Result<(), DeviceError> {
        let device = self.device()?;
        device.check_connected()?;

        let mut acquisition = lock(&device.acquisition);
        if acquisition.is_some() || buffer_count == 0 {
            return Err(DeviceError::Sdk {
                call: "VmbCaptureStart",
                code: INVALID_CALL,
            });
        }

        let pool = Arc::new(SimulatedPool {
            queued: (0..buffer_count).map(|_| AtomicBool::new(true)).collect(),
            device: Arc::clone(&self.camera.device),
        });
        let running = Arc::new(AtomicBool::new(true));

        let thread_device = Arc::clone(&self.camera.device);
        let thread_running = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("sim-acquisition".to_string())
            .spawn(move || run_acquisition(thread_device, pool, handler, thread_running))
            .map_err(|_| DeviceError::Sdk {
                call: "VmbCaptureStart",
                code: INVALID_CALL,
            })?;

        *acquisition = Some(Acquisition { running, thread });
        debug!(
            "Simulated acquisition started on {} with {} buffers",
            device.model.id, buffer_count
        );
        Ok(())
    }

    fn stop_continuous_acquisition(&self) -> Result<(), DeviceError> {
        self.device()?.stop_acquisition()
    }

    fn close(&self) -> Result<(), DeviceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let device = &self.camera.device;
        device.stop_acquisition()?;
        device.open_handles.fetch_sub(1, Ordering::SeqCst);
        debug!("Simulated camera {} closed", device.model.id);
        Ok(())
    }
}

/// Simulated SDK runtime owning a fixed set of cameras
pub struct SimulatedSystem {
    cameras: Vec<SimulatedCamera>,
    runtime_active: AtomicUsize,
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl SimulatedSystem {
    pub fn new(cameras: Vec<SimulatedCamera>) -> Self {
        Self {
            cameras,
            runtime_active: AtomicUsize::new(0),
            startups: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// A system with one camera built from `model`
    pub fn single(model: SimulatedModel) -> Self {
        Self::new(vec![SimulatedCamera::new(model)])
    }

    pub fn camera(&self, index: usize) -> Option<&SimulatedCamera> {
        self.cameras.get(index)
    }

    /// Whether a startup has not yet been matched by a shutdown
    pub fn runtime_active(&self) -> bool {
        self.runtime_active.load(Ordering::SeqCst) > 0
    }

    pub fn startups(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn check_runtime(&self, call: &'static str) -> Result<(), DeviceError> {
        if self.runtime_active() {
            Ok(())
        } else {
            // VmbErrorApiNotStarted
            Err(DeviceError::Sdk { call, code: -2 })
        }
    }
}

impl CameraSystem for SimulatedSystem {
    type Camera = SimulatedHandle;

    fn startup(&self) -> Result<(), DeviceError> {
        self.startups.fetch_add(1, Ordering::SeqCst);
        self.runtime_active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .runtime_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn cameras(&self) -> Result<Vec<CameraInfo>, DeviceError> {
        self.check_runtime("VmbCamerasList")?;

        let mut listed = Vec::with_capacity(self.cameras.len());
        for camera in &self.cameras {
            if !camera.device.connected.load(Ordering::SeqCst) {
                continue;
            }
            let mut state = lock(&camera.device.state);
            if state.offline_polls > 0 {
                state.offline_polls -= 1;
                continue;
            }
            listed.push(camera.info());
        }
        Ok(listed)
    }

    fn open(&self, id: &str, mode: AccessMode) -> Result<SimulatedHandle, DeviceError> {
        self.check_runtime("VmbCameraOpen")?;

        let camera = self
            .cameras
            .iter()
            .find(|c| c.device.model.id == id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        camera.device.check_connected()?;

        if lock(&camera.device.state).offline_polls > 0 {
            return Err(DeviceError::NotFound(id.to_string()));
        }

        // Full access is exclusive
        if mode == AccessMode::Full && camera.open_handles() > 0 {
            return Err(DeviceError::Sdk {
                call: "VmbCameraOpen",
                code: -6,
            });
        }

        camera.device.open_handles.fetch_add(1, Ordering::SeqCst);
        camera.device.total_opens.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated camera {} opened ({:?})", id, mode);

        Ok(SimulatedHandle {
            camera: camera.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_default() -> (SimulatedSystem, SimulatedHandle) {
        let system = SimulatedSystem::single(SimulatedModel::default());
        system.startup().unwrap();
        let handle = system.open("DEV_SIM0001", AccessMode::Full).unwrap();
        (system, handle)
    }

    #[test]
    fn test_frame_rate_rejected_above_real_limit() {
        let (system, handle) = open_default();
        let limit = system.camera(0).unwrap().limit_fps();

        assert!(handle.set_float(features::ACQUISITION_FRAME_RATE, limit - 0.5).is_ok());
        let err = handle
            .set_float(features::ACQUISITION_FRAME_RATE, limit + 0.01)
            .unwrap_err();
        assert!(err.is_rejection());
        // Advertised bound is above the real one
        assert!(1e6 / handle.float(features::EXPOSURE_TIME).unwrap() > limit);
    }

    #[test]
    fn test_longer_exposure_pulls_frame_rate_down() {
        let (_system, handle) = open_default();
        handle.set_float(features::ACQUISITION_FRAME_RATE, 150.0).unwrap();
        handle.set_float(features::EXPOSURE_TIME, 20_000.0).unwrap();

        let rate = handle.float(features::ACQUISITION_FRAME_RATE).unwrap();
        assert!(rate <= 1e6 / 20_350.0);
    }

    #[test]
    fn test_full_access_is_exclusive() {
        let (system, handle) = open_default();
        assert!(system.open("DEV_SIM0001", AccessMode::Full).is_err());

        handle.close().unwrap();
        assert_eq!(system.camera(0).unwrap().open_handles(), 0);
        assert_eq!(
            handle.float(features::GAIN).unwrap_err(),
            DeviceError::InvalidHandle
        );
        assert!(system.open("DEV_SIM0001", AccessMode::Full).is_ok());
    }

    #[test]
    fn test_runtime_required_for_enumeration() {
        let system = SimulatedSystem::single(SimulatedModel::default());
        assert!(system.cameras().is_err());
        system.startup().unwrap();
        assert_eq!(system.cameras().unwrap().len(), 1);
        system.shutdown();
        assert!(!system.runtime_active());
    }

    #[test]
    fn test_disconnect_fails_feature_access() {
        let (system, handle) = open_default();
        system.camera(0).unwrap().disconnect();
        let err = handle.float(features::EXPOSURE_TIME).unwrap_err();
        assert!(matches!(err, DeviceError::CommunicationLost(_)));
    }

    #[test]
    fn test_reset_takes_camera_offline_for_a_few_polls() {
        let (system, handle) = open_default();
        handle.run_command(features::DEVICE_RESET).unwrap();
        handle.close().unwrap();

        assert!(system.cameras().unwrap().is_empty());
        assert!(system.cameras().unwrap().is_empty());
        assert_eq!(system.cameras().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_can_be_refused() {
        let model = SimulatedModel {
            reject_reset: true,
            ..Default::default()
        };
        let system = SimulatedSystem::single(model);
        system.startup().unwrap();
        let handle = system.open("DEV_SIM0001", AccessMode::Full).unwrap();

        let err = handle.run_command(features::DEVICE_RESET).unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(system.cameras().unwrap().len(), 1);
    }

    #[test]
    fn test_acquisition_returns_every_buffer() {
        let model = SimulatedModel {
            incomplete_every: Some(3),
            ..Default::default()
        };
        let system = SimulatedSystem::single(model);
        system.startup().unwrap();
        let handle = system.open("DEV_SIM0001", AccessMode::Full).unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_handler = Arc::clone(&seen);
        let handler: FrameHandler = Arc::new(move |frame: ReceivedFrame<'_>| {
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
            if frame.status().is_complete() {
                let _ = frame.requeue();
            }
        });

        handle.start_continuous_acquisition(3, handler).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        handle.stop_continuous_acquisition().unwrap();

        let camera = system.camera(0).unwrap();
        assert!(seen.load(Ordering::SeqCst) > 3);
        assert_eq!(camera.frames_delivered(), seen.load(Ordering::SeqCst));
        assert_eq!(camera.buffers_requeued(), camera.frames_delivered());
        assert_eq!(camera.double_requeues(), 0);
        assert!(!camera.is_acquiring());
    }
}
