//! Frame Callback Bridge
//!
//! Runs on the driver's delivery thread. Each callback copies the borrowed
//! buffer into a new image, hands the buffer back to the driver, and only
//! then publishes the copy, so a slow subscriber never holds a device buffer.

use crate::data_frame::{DataFrame, FrameGeometry};
use crate::source::{SessionStats, StreamEvent};
use camera_device::{PixelFormat, ReceivedFrame};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Copy `data` into an image of `geometry`, or `None` if it is too short
pub(crate) fn copy_image(geometry: &FrameGeometry, data: &[u8]) -> Option<DynamicImage> {
    let pixels = data.get(..geometry.frame_len())?;
    match geometry.pixel_format {
        PixelFormat::Mono8 => GrayImage::from_raw(geometry.width, geometry.height, pixels.to_vec())
            .map(DynamicImage::ImageLuma8),
        PixelFormat::Mono16 => {
            let samples: Vec<u16> = pixels
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(geometry.width, geometry.height, samples)
                .map(DynamicImage::ImageLuma16)
        }
    }
}

/// Frame-ready handler for one streaming session
pub struct FrameBridge {
    geometry: FrameGeometry,
    clock: Instant,
    sender: broadcast::Sender<StreamEvent>,
    stats: Arc<SessionStats>,
}

impl FrameBridge {
    /// Starts the session's monotonic clock
    pub fn new(
        geometry: FrameGeometry,
        sender: broadcast::Sender<StreamEvent>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            geometry,
            clock: Instant::now(),
            sender,
            stats,
        }
    }

    pub fn on_frame(&self, frame: ReceivedFrame<'_>) {
        let info = *frame.info();
        let copied = if info.status.is_complete() {
            let image = copy_image(&self.geometry, frame.data());
            if image.is_none() {
                debug!(
                    "Frame {} buffer holds {} bytes, expected {}",
                    info.frame_id,
                    frame.data().len(),
                    self.geometry.frame_len()
                );
            }
            image.map(|image| (image, self.clock.elapsed()))
        } else {
            debug!("Dropping frame {} with status {:?}", info.frame_id, info.status);
            None
        };

        if let Err(e) = frame.requeue() {
            warn!("Failed to requeue buffer of frame {}: {}", info.frame_id, e);
            self.stats.record_requeue_failure();
            metrics::counter!("capture_buffer_requeue_failures_total").increment(1);
        }

        let Some((image, elapsed)) = copied else {
            self.stats.record_dropped();
            metrics::counter!("capture_frames_incomplete_total").increment(1);
            return;
        };

        let data = DataFrame {
            image,
            timestamp: elapsed,
            ticks: duration_ticks(elapsed),
            frame_id: info.frame_id,
            device_timestamp: info.device_timestamp,
        };
        // Only fails with no subscribers left, which the worker notices on its own
        let _ = self.sender.send(StreamEvent::Frame(Arc::new(data)));
        self.stats.record_emitted();
        metrics::counter!("capture_frames_emitted_total").increment(1);
    }
}

fn duration_ticks(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_device::{BufferPool, DeviceError, FrameInfo, FrameStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPool {
        requeued: AtomicUsize,
        fail: bool,
    }

    impl BufferPool for CountingPool {
        fn requeue(&self, _slot: usize) -> Result<(), DeviceError> {
            self.requeued.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DeviceError::Sdk {
                    call: "VmbCaptureFrameQueue",
                    code: -15,
                })
            } else {
                Ok(())
            }
        }
    }

    fn geometry(pixel_format: PixelFormat) -> FrameGeometry {
        FrameGeometry {
            width: 4,
            height: 2,
            pixel_format,
        }
    }

    fn info(frame_id: u64, status: FrameStatus) -> FrameInfo {
        FrameInfo {
            frame_id,
            width: 4,
            height: 2,
            device_timestamp: 1234,
            status,
        }
    }

    fn bridge(pixel_format: PixelFormat) -> (FrameBridge, broadcast::Receiver<StreamEvent>, Arc<SessionStats>) {
        let (sender, receiver) = broadcast::channel(8);
        let stats = Arc::new(SessionStats::default());
        let bridge = FrameBridge::new(geometry(pixel_format), sender, Arc::clone(&stats));
        (bridge, receiver, stats)
    }

    #[test]
    fn test_complete_frame_is_copied_and_returned() {
        let (bridge, mut receiver, stats) = bridge(PixelFormat::Mono8);
        let pool = CountingPool::default();
        let data: Vec<u8> = (0..8).collect();

        bridge.on_frame(ReceivedFrame::new(info(5, FrameStatus::Complete), &data, 0, &pool));

        assert_eq!(pool.requeued.load(Ordering::SeqCst), 1);
        let Ok(StreamEvent::Frame(frame)) = receiver.try_recv() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.frame_id, 5);
        assert_eq!(frame.device_timestamp, 1234);
        assert_eq!(frame.ticks, frame.timestamp.as_nanos() as u64);
        assert_eq!(frame.image.as_luma8().unwrap().as_raw(), &data);
        assert_eq!(stats.snapshot().frames_emitted, 1);
    }

    #[test]
    fn test_incomplete_frame_is_returned_not_emitted() {
        let (bridge, mut receiver, stats) = bridge(PixelFormat::Mono8);
        let pool = CountingPool::default();
        let data = [0u8; 8];

        bridge.on_frame(ReceivedFrame::new(info(1, FrameStatus::Incomplete), &data, 0, &pool));

        assert_eq!(pool.requeued.load(Ordering::SeqCst), 1);
        assert!(receiver.try_recv().is_err());
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }

    #[test]
    fn test_short_buffer_is_dropped() {
        let (bridge, mut receiver, stats) = bridge(PixelFormat::Mono16);
        let pool = CountingPool::default();
        let data = [0u8; 8];

        bridge.on_frame(ReceivedFrame::new(info(1, FrameStatus::Complete), &data, 2, &pool));

        assert_eq!(pool.requeued.load(Ordering::SeqCst), 1);
        assert!(receiver.try_recv().is_err());
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }

    #[test]
    fn test_requeue_failure_still_emits_copy() {
        let (bridge, mut receiver, stats) = bridge(PixelFormat::Mono8);
        let pool = CountingPool {
            fail: true,
            ..Default::default()
        };
        let data = [7u8; 8];

        bridge.on_frame(ReceivedFrame::new(info(3, FrameStatus::Complete), &data, 0, &pool));

        assert_eq!(pool.requeued.load(Ordering::SeqCst), 1);
        assert!(matches!(receiver.try_recv(), Ok(StreamEvent::Frame(_))));
        assert_eq!(stats.snapshot().requeue_failures, 1);
    }

    #[test]
    fn test_mono16_is_little_endian() {
        let data = [0x34, 0x12, 0xff, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let image = copy_image(&geometry(PixelFormat::Mono16), &data).unwrap();
        let pixels = image.as_luma16().unwrap();
        assert_eq!(pixels.get_pixel(0, 0).0, [0x1234]);
        assert_eq!(pixels.get_pixel(1, 0).0, [0x00ff]);
    }

    #[test]
    fn test_longer_buffer_is_truncated_to_geometry() {
        let data = [1u8; 12];
        let image = copy_image(&geometry(PixelFormat::Mono8), &data).unwrap();
        assert_eq!(image.as_luma8().unwrap().as_raw().len(), 8);
    }
}
