//! Borrowed frame buffers and their return to the driver pool

use crate::DeviceError;
use tracing::warn;

/// Receive status reported by the driver for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete,
    TooSmall,
    Invalid,
}

impl FrameStatus {
    /// Map a Vimba `VmbFrameStatus` code
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FrameStatus::Complete,
            -1 => FrameStatus::Incomplete,
            -2 => FrameStatus::TooSmall,
            _ => FrameStatus::Invalid,
        }
    }

    pub fn is_complete(&self) -> bool {
        *self == FrameStatus::Complete
    }
}

/// Pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
    Mono16,
}

impl PixelFormat {
    /// Parse the `PixelFormat` feature value
    pub fn from_feature(value: &str) -> Option<Self> {
        match value {
            "Mono8" => Some(PixelFormat::Mono8),
            "Mono16" => Some(PixelFormat::Mono16),
            _ => None,
        }
    }

    pub fn feature_name(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono16 => "Mono16",
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
        }
    }
}

/// Metadata delivered with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Hardware frame sequence id
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    /// Device clock timestamp (ticks of the camera's own clock)
    pub device_timestamp: u64,
    pub status: FrameStatus,
}

/// Driver-side pool that announced buffers are returned to
pub trait BufferPool: Send + Sync {
    /// Queue buffer `slot` for capture again
    fn requeue(&self, slot: usize) -> Result<(), DeviceError>;
}

/// A hardware-owned buffer lent to the frame handler.
///
/// The pixel data is only valid for the lifetime `'a`, which ends when the
/// handler returns. The buffer goes back to the driver exactly once: either
/// through [`requeue`](ReceivedFrame::requeue) or, failing that, on drop.
pub struct ReceivedFrame<'a> {
    info: FrameInfo,
    data: &'a [u8],
    slot: usize,
    pool: &'a dyn BufferPool,
    requeued: bool,
}

impl<'a> ReceivedFrame<'a> {
    pub fn new(info: FrameInfo, data: &'a [u8], slot: usize, pool: &'a dyn BufferPool) -> Self {
        Self {
            info,
            data,
            slot,
            pool,
            requeued: false,
        }
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn status(&self) -> FrameStatus {
        self.info.status
    }

    /// Raw pixel bytes
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Return the buffer to the driver pool
    pub fn requeue(mut self) -> Result<(), DeviceError> {
        self.requeued = true;
        self.pool.requeue(self.slot)
    }
}

impl Drop for ReceivedFrame<'_> {
    fn drop(&mut self) {
        if !self.requeued {
            if let Err(e) = self.pool.requeue(self.slot) {
                warn!("Failed to requeue frame {} buffer: {}", self.info.frame_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPool {
        requeued: AtomicUsize,
    }

    impl BufferPool for CountingPool {
        fn requeue(&self, _slot: usize) -> Result<(), DeviceError> {
            self.requeued.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn info(status: FrameStatus) -> FrameInfo {
        FrameInfo {
            frame_id: 7,
            width: 2,
            height: 2,
            device_timestamp: 0,
            status,
        }
    }

    #[test]
    fn test_explicit_requeue_returns_once() {
        let pool = CountingPool::default();
        let data = [0u8; 4];
        let frame = ReceivedFrame::new(info(FrameStatus::Complete), &data, 0, &pool);
        frame.requeue().unwrap();
        assert_eq!(pool.requeued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_requeues_unreturned_buffer() {
        let pool = CountingPool::default();
        let data = [0u8; 4];
        {
            let frame = ReceivedFrame::new(info(FrameStatus::Incomplete), &data, 1, &pool);
            assert_eq!(frame.status(), FrameStatus::Incomplete);
        }
        assert_eq!(pool.requeued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(FrameStatus::from_code(0), FrameStatus::Complete);
        assert_eq!(FrameStatus::from_code(-1), FrameStatus::Incomplete);
        assert_eq!(FrameStatus::from_code(-2), FrameStatus::TooSmall);
        assert_eq!(FrameStatus::from_code(-99), FrameStatus::Invalid);
    }

    #[test]
    fn test_pixel_format_parsing() {
        assert_eq!(PixelFormat::from_feature("Mono16"), Some(PixelFormat::Mono16));
        assert_eq!(PixelFormat::from_feature("BayerRG8"), None);
        assert_eq!(PixelFormat::Mono16.bytes_per_pixel(), 2);
    }
}
