//! Emitted frames and frame geometry

use camera_device::PixelFormat;
use image::DynamicImage;
use std::time::Duration;

/// A frame copied out of a device buffer. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub image: DynamicImage,
    /// Monotonic time since the session started streaming
    pub timestamp: Duration,
    /// `timestamp` in nanoseconds
    pub ticks: u64,
    /// Hardware frame sequence id
    pub frame_id: u64,
    /// Timestamp from the camera's own clock
    pub device_timestamp: u64,
}

/// Image layout recorded while calibrating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl FrameGeometry {
    /// Bytes a complete frame occupies
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }
}
