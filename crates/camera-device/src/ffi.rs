//! FFI bindings for the Vimba C API
//!
//! Safe wrappers around `VmbC` covering enumeration, feature access and
//! continuous acquisition. Frames are delivered from Vimba's own capture
//! thread through [`frame_callback`], which lends each buffer to the
//! registered [`FrameHandler`] and requeues it afterwards.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::features;
use crate::frame::{BufferPool, FrameInfo, FrameStatus, ReceivedFrame};
use crate::{AccessMode, Camera, CameraInfo, CameraSystem, DeviceError, FeatureSet, FrameHandler};

type VmbErrorType = i32;
type VmbHandle = *mut c_void;

/// Vimba error codes (VmbCommonTypes.h)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmbErrorCode {
    Success = 0,
    InternalFault = -1,
    ApiNotStarted = -2,
    NotFound = -3,
    BadHandle = -4,
    DeviceNotOpen = -5,
    InvalidAccess = -6,
    BadParameter = -7,
    StructSize = -8,
    MoreData = -9,
    WrongType = -10,
    InvalidValue = -11,
    Timeout = -12,
    Other = -13,
    Resources = -14,
    InvalidCall = -15,
    NoTransportLayer = -16,
    NotImplemented = -17,
    NotSupported = -18,
    Incomplete = -19,
    Io = -20,
}

impl From<i32> for VmbErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::InternalFault,
            -2 => Self::ApiNotStarted,
            -3 => Self::NotFound,
            -4 => Self::BadHandle,
            -5 => Self::DeviceNotOpen,
            -6 => Self::InvalidAccess,
            -7 => Self::BadParameter,
            -8 => Self::StructSize,
            -9 => Self::MoreData,
            -10 => Self::WrongType,
            -11 => Self::InvalidValue,
            -12 => Self::Timeout,
            -14 => Self::Resources,
            -15 => Self::InvalidCall,
            -16 => Self::NoTransportLayer,
            -17 => Self::NotImplemented,
            -18 => Self::NotSupported,
            -19 => Self::Incomplete,
            -20 => Self::Io,
            _ => Self::Other,
        }
    }
}

/// `VmbAccessModeFull`
const VMB_ACCESS_MODE_FULL: u32 = 1;
/// `VmbAccessModeRead`
const VMB_ACCESS_MODE_READ: u32 = 2;

/// C camera info structure (matches VmbCameraInfo_t)
#[repr(C)]
#[allow(dead_code)]
struct VmbCameraInfo {
    camera_id_string: *const c_char,
    camera_name: *const c_char,
    model_name: *const c_char,
    serial_string: *const c_char,
    permitted_access: u32,
    interface_id_string: *const c_char,
}

/// C frame structure (matches VmbFrame_t)
#[repr(C)]
#[allow(dead_code)]
struct VmbFrame {
    buffer: *mut c_void,
    buffer_size: u32,
    context: [*mut c_void; 4],
    receive_status: i32,
    receive_flags: u32,
    image_size: u32,
    ancillary_size: u32,
    pixel_format: u32,
    width: u32,
    height: u32,
    offset_x: u32,
    offset_y: u32,
    frame_id: u64,
    timestamp: u64,
}

type VmbFrameCallback = unsafe extern "system" fn(camera: VmbHandle, frame: *mut VmbFrame);

extern "system" {
    fn VmbStartup() -> VmbErrorType;
    fn VmbShutdown();
    fn VmbCamerasList(
        camera_info: *mut VmbCameraInfo,
        list_length: u32,
        num_found: *mut u32,
        sizeof_camera_info: u32,
    ) -> VmbErrorType;
    fn VmbCameraOpen(id: *const c_char, access_mode: u32, handle: *mut VmbHandle) -> VmbErrorType;
    fn VmbCameraClose(handle: VmbHandle) -> VmbErrorType;

    fn VmbFeatureFloatGet(handle: VmbHandle, name: *const c_char, value: *mut f64) -> VmbErrorType;
    fn VmbFeatureFloatSet(handle: VmbHandle, name: *const c_char, value: f64) -> VmbErrorType;
    fn VmbFeatureIntGet(handle: VmbHandle, name: *const c_char, value: *mut i64) -> VmbErrorType;
    fn VmbFeatureIntSet(handle: VmbHandle, name: *const c_char, value: i64) -> VmbErrorType;
    fn VmbFeatureEnumGet(
        handle: VmbHandle,
        name: *const c_char,
        value: *mut *const c_char,
    ) -> VmbErrorType;
    fn VmbFeatureEnumSet(handle: VmbHandle, name: *const c_char, value: *const c_char)
        -> VmbErrorType;
    fn VmbFeatureCommandRun(handle: VmbHandle, name: *const c_char) -> VmbErrorType;

    fn VmbFrameAnnounce(handle: VmbHandle, frame: *const VmbFrame, sizeof_frame: u32)
        -> VmbErrorType;
    fn VmbFrameRevokeAll(handle: VmbHandle) -> VmbErrorType;
    fn VmbCaptureStart(handle: VmbHandle) -> VmbErrorType;
    fn VmbCaptureEnd(handle: VmbHandle) -> VmbErrorType;
    fn VmbCaptureFrameQueue(
        handle: VmbHandle,
        frame: *const VmbFrame,
        callback: Option<VmbFrameCallback>,
    ) -> VmbErrorType;
    fn VmbCaptureQueueFlush(handle: VmbHandle) -> VmbErrorType;
}

fn check(call: &'static str, code: VmbErrorType) -> Result<(), DeviceError> {
    if code == VmbErrorCode::Success as i32 {
        Ok(())
    } else {
        Err(DeviceError::Sdk { call, code })
    }
}

/// Map a failed feature call onto the device error taxonomy
fn feature_error(feature: &str, call: &'static str, code: VmbErrorType) -> DeviceError {
    match VmbErrorCode::from(code) {
        VmbErrorCode::InvalidValue | VmbErrorCode::InvalidAccess => {
            DeviceError::rejected(feature, format!("{} returned {}", call, code))
        }
        VmbErrorCode::NotFound => DeviceError::FeatureNotFound(feature.to_string()),
        VmbErrorCode::WrongType => DeviceError::WrongType(feature.to_string()),
        VmbErrorCode::BadHandle | VmbErrorCode::DeviceNotOpen => DeviceError::InvalidHandle,
        VmbErrorCode::Timeout | VmbErrorCode::Io => {
            DeviceError::CommunicationLost(format!("{} on {} returned {}", call, feature, code))
        }
        _ => DeviceError::Sdk { call, code },
    }
}

fn c_name(name: &str) -> Result<CString, DeviceError> {
    CString::new(name).map_err(|_| DeviceError::FeatureNotFound(name.to_string()))
}

unsafe fn owned_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// The Vimba runtime
#[derive(Default)]
pub struct VimbaSystem {
    _private: (),
}

impl VimbaSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CameraSystem for VimbaSystem {
    type Camera = VimbaCamera;

    fn startup(&self) -> Result<(), DeviceError> {
        check("VmbStartup", unsafe { VmbStartup() })?;
        info!("Vimba runtime started");
        Ok(())
    }

    fn shutdown(&self) {
        unsafe { VmbShutdown() };
        info!("Vimba runtime shut down");
    }

    fn cameras(&self) -> Result<Vec<CameraInfo>, DeviceError> {
        let sizeof_info = std::mem::size_of::<VmbCameraInfo>() as u32;
        let mut count = 0u32;
        check("VmbCamerasList", unsafe {
            VmbCamerasList(ptr::null_mut(), 0, &mut count, sizeof_info)
        })?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut infos: Vec<VmbCameraInfo> = Vec::with_capacity(count as usize);
        let mut found = 0u32;
        let code =
            unsafe { VmbCamerasList(infos.as_mut_ptr(), count, &mut found, sizeof_info) };
        // The list may have grown between the two calls
        if code != VmbErrorCode::MoreData as i32 {
            check("VmbCamerasList", code)?;
        }
        unsafe { infos.set_len(found.min(count) as usize) };

        Ok(infos
            .iter()
            .map(|info| unsafe {
                CameraInfo {
                    id: owned_string(info.camera_id_string),
                    name: owned_string(info.camera_name),
                    model: owned_string(info.model_name),
                    serial: owned_string(info.serial_string),
                }
            })
            .collect())
    }

    fn open(&self, id: &str, mode: AccessMode) -> Result<VimbaCamera, DeviceError> {
        let c_id = CString::new(id).map_err(|_| DeviceError::NotFound(id.to_string()))?;
        let access = match mode {
            AccessMode::Full => VMB_ACCESS_MODE_FULL,
            AccessMode::Read => VMB_ACCESS_MODE_READ,
        };

        let mut handle: VmbHandle = ptr::null_mut();
        let code = unsafe { VmbCameraOpen(c_id.as_ptr(), access, &mut handle) };
        match VmbErrorCode::from(code) {
            VmbErrorCode::Success => {}
            VmbErrorCode::NotFound => return Err(DeviceError::NotFound(id.to_string())),
            _ => return Err(DeviceError::Sdk { call: "VmbCameraOpen", code }),
        }

        info!("Opened Vimba camera {}", id);
        Ok(VimbaCamera {
            id: id.to_string(),
            handle,
            closed: AtomicBool::new(false),
            streaming: Mutex::new(None),
        })
    }
}

/// Announced frames of one running acquisition, requeued from the callback
struct VimbaPool {
    handle: VmbHandle,
    frames: *const VmbFrame,
    len: usize,
}

impl BufferPool for VimbaPool {
    fn requeue(&self, slot: usize) -> Result<(), DeviceError> {
        if slot >= self.len {
            return Err(DeviceError::Sdk {
                call: "VmbCaptureFrameQueue",
                code: VmbErrorCode::BadParameter as i32,
            });
        }
        check("VmbCaptureFrameQueue", unsafe {
            VmbCaptureFrameQueue(self.handle, self.frames.add(slot), Some(frame_callback))
        })
    }
}

/// State reachable from `VmbFrame::context[0]` while streaming
struct StreamContext {
    handler: FrameHandler,
    pool: VimbaPool,
}

/// Buffers and frames must not move while Vimba holds pointers to them
struct Streaming {
    context: Box<StreamContext>,
    frames: Box<[VmbFrame]>,
    _buffers: Vec<Box<[u8]>>,
}

// SAFETY: The raw pointers refer to allocations owned by `Streaming`, which
// outlives every callback because acquisition is ended and the queue flushed
// before it is dropped.
unsafe impl Send for VimbaPool {}
unsafe impl Sync for VimbaPool {}
unsafe impl Send for Streaming {}

unsafe extern "system" fn frame_callback(_camera: VmbHandle, frame: *mut VmbFrame) {
    if frame.is_null() {
        return;
    }
    let frame = &*frame;
    let context = frame.context[0] as *const StreamContext;
    if context.is_null() {
        return;
    }
    let context = &*context;
    let slot = frame.context[1] as usize;

    let len = (if frame.image_size > 0 {
        frame.image_size.min(frame.buffer_size)
    } else {
        frame.buffer_size
    }) as usize;
    let data = std::slice::from_raw_parts(frame.buffer as *const u8, len);
    let info = FrameInfo {
        frame_id: frame.frame_id,
        width: frame.width,
        height: frame.height,
        device_timestamp: frame.timestamp,
        status: FrameStatus::from_code(frame.receive_status),
    };

    // Unwinding across the C boundary is undefined
    let result = catch_unwind(AssertUnwindSafe(|| {
        (context.handler)(ReceivedFrame::new(info, data, slot, &context.pool));
    }));
    if result.is_err() {
        error!("Frame handler panicked on frame {}", info.frame_id);
    }
}

/// An open Vimba camera
pub struct VimbaCamera {
    id: String,
    handle: VmbHandle,
    closed: AtomicBool,
    streaming: Mutex<Option<Streaming>>,
}

// SAFETY: Vimba handles may be used from any thread.
unsafe impl Send for VimbaCamera {}
unsafe impl Sync for VimbaCamera {}

impl VimbaCamera {
    fn handle(&self) -> Result<VmbHandle, DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DeviceError::InvalidHandle)
        } else {
            Ok(self.handle)
        }
    }

    fn end_capture(&self, handle: VmbHandle) {
        for (call, code) in [
            ("VmbCaptureEnd", unsafe { VmbCaptureEnd(handle) }),
            ("VmbCaptureQueueFlush", unsafe { VmbCaptureQueueFlush(handle) }),
            ("VmbFrameRevokeAll", unsafe { VmbFrameRevokeAll(handle) }),
        ] {
            if let Err(e) = check(call, code) {
                warn!("{} while stopping {}", e, self.id);
            }
        }
    }
}

impl FeatureSet for VimbaCamera {
    fn float(&self, name: &str) -> Result<f64, DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let mut value = 0.0;
        let code = unsafe { VmbFeatureFloatGet(handle, c.as_ptr(), &mut value) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureFloatGet", code));
        }
        Ok(value)
    }

    fn set_float(&self, name: &str, value: f64) -> Result<(), DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let code = unsafe { VmbFeatureFloatSet(handle, c.as_ptr(), value) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureFloatSet", code));
        }
        Ok(())
    }

    fn int(&self, name: &str) -> Result<i64, DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let mut value = 0i64;
        let code = unsafe { VmbFeatureIntGet(handle, c.as_ptr(), &mut value) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureIntGet", code));
        }
        Ok(value)
    }

    fn set_int(&self, name: &str, value: i64) -> Result<(), DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let code = unsafe { VmbFeatureIntSet(handle, c.as_ptr(), value) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureIntSet", code));
        }
        Ok(())
    }

    fn enumeration(&self, name: &str) -> Result<String, DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let mut value: *const c_char = ptr::null();
        let code = unsafe { VmbFeatureEnumGet(handle, c.as_ptr(), &mut value) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureEnumGet", code));
        }
        Ok(unsafe { owned_string(value) })
    }

    fn set_enumeration(&self, name: &str, value: &str) -> Result<(), DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let c_value = CString::new(value)
            .map_err(|_| DeviceError::rejected(name, format!("invalid value {:?}", value)))?;
        let code = unsafe { VmbFeatureEnumSet(handle, c.as_ptr(), c_value.as_ptr()) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureEnumSet", code));
        }
        Ok(())
    }

    fn run_command(&self, name: &str) -> Result<(), DeviceError> {
        let handle = self.handle()?;
        let c = c_name(name)?;
        let code = unsafe { VmbFeatureCommandRun(handle, c.as_ptr()) };
        if code != 0 {
            return Err(feature_error(name, "VmbFeatureCommandRun", code));
        }
        Ok(())
    }
}

impl Camera for VimbaCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_continuous_acquisition(
        &self,
        buffer_count: usize,
        handler: FrameHandler,
    ) -> Result<(), DeviceError> {
        let handle = self.handle()?;
        let mut streaming = self.streaming.lock().unwrap_or_else(PoisonError::into_inner);
        if streaming.is_some() {
            return Err(DeviceError::Sdk {
                call: "VmbCaptureStart",
                code: VmbErrorCode::InvalidCall as i32,
            });
        }

        let payload = usize::try_from(self.int(features::PAYLOAD_SIZE)?)
            .map_err(|_| DeviceError::rejected(features::PAYLOAD_SIZE, "negative payload"))?;
        let mut buffers: Vec<Box<[u8]>> =
            (0..buffer_count).map(|_| vec![0u8; payload].into_boxed_slice()).collect();
        let mut frames: Box<[VmbFrame]> = buffers
            .iter_mut()
            .map(|buffer| VmbFrame {
                buffer: buffer.as_mut_ptr() as *mut c_void,
                buffer_size: payload as u32,
                context: [ptr::null_mut(); 4],
                receive_status: 0,
                receive_flags: 0,
                image_size: 0,
                ancillary_size: 0,
                pixel_format: 0,
                width: 0,
                height: 0,
                offset_x: 0,
                offset_y: 0,
                frame_id: 0,
                timestamp: 0,
            })
            .collect();

        let context = Box::new(StreamContext {
            handler,
            pool: VimbaPool {
                handle,
                frames: frames.as_ptr(),
                len: frames.len(),
            },
        });
        let context_ptr = &*context as *const StreamContext as *mut c_void;
        for (slot, frame) in frames.iter_mut().enumerate() {
            frame.context[0] = context_ptr;
            frame.context[1] = slot as *mut c_void;
        }

        let sizeof_frame = std::mem::size_of::<VmbFrame>() as u32;
        let started = frames
            .iter()
            .try_for_each(|frame| {
                check("VmbFrameAnnounce", unsafe {
                    VmbFrameAnnounce(handle, frame, sizeof_frame)
                })
            })
            .and_then(|_| check("VmbCaptureStart", unsafe { VmbCaptureStart(handle) }))
            .and_then(|_| {
                frames.iter().try_for_each(|frame| {
                    check("VmbCaptureFrameQueue", unsafe {
                        VmbCaptureFrameQueue(handle, frame, Some(frame_callback))
                    })
                })
            })
            .and_then(|_| self.run_command(features::ACQUISITION_START));

        if let Err(e) = started {
            self.end_capture(handle);
            return Err(e);
        }

        debug!("Vimba acquisition started on {} with {} buffers", self.id, buffer_count);
        *streaming = Some(Streaming {
            context,
            frames,
            _buffers: buffers,
        });
        Ok(())
    }

    fn stop_continuous_acquisition(&self) -> Result<(), DeviceError> {
        let handle = self.handle()?;
        let streaming = self
            .streaming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(streaming) = streaming else {
            return Ok(());
        };

        if let Err(e) = self.run_command(features::ACQUISITION_STOP) {
            warn!("AcquisitionStop failed on {}: {}", self.id, e);
        }
        self.end_capture(handle);

        debug!(
            "Vimba acquisition stopped on {} ({} frames revoked)",
            self.id,
            streaming.frames.len()
        );
        drop(streaming.context);
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        if self.streaming.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            self.stop_continuous_acquisition()?;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        check("VmbCameraClose", unsafe { VmbCameraClose(self.handle) })?;
        info!("Closed Vimba camera {}", self.id);
        Ok(())
    }
}

impl Drop for VimbaCamera {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!("Failed to close {} on drop: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(VmbErrorCode::from(0), VmbErrorCode::Success);
        assert_eq!(VmbErrorCode::from(-11), VmbErrorCode::InvalidValue);
        assert_eq!(VmbErrorCode::from(-999), VmbErrorCode::Other);
    }

    #[test]
    fn test_invalid_value_is_rejection() {
        let err = feature_error(features::ACQUISITION_FRAME_RATE, "VmbFeatureFloatSet", -11);
        assert!(err.is_rejection());
        let err = feature_error(features::ACQUISITION_FRAME_RATE, "VmbFeatureFloatSet", -20);
        assert!(matches!(err, DeviceError::CommunicationLost(_)));
    }
}
