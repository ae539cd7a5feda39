//! Shared Capture Source
//!
//! Subscribers share one device session. The first `generate` starts it,
//! dropping the last stream cancels it, and a `generate` after the session
//! has ended starts a fresh one.

use crate::data_frame::DataFrame;
use crate::parameters::{AcquisitionParameters, Pending};
use crate::session::{Session, SessionContext, SessionState};
use crate::{lock, CaptureConfig, CaptureError};
use camera_device::CameraSystem;
use frame_rate_calibrator::CalibrationState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Item published to every subscriber of a session
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(Arc<DataFrame>),
    /// The session ended after cancellation
    Closed,
    /// The session ended with an error
    Failed(CaptureError),
}

/// Counters accumulated over all sessions of a source
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_emitted: AtomicU64,
    frames_dropped: AtomicU64,
    requeue_failures: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frames_emitted: u64,
    /// Incomplete or short frames that were returned without emission
    pub frames_dropped: u64,
    pub requeue_failures: u64,
    pub sessions: u64,
}

impl SessionStats {
    pub fn record_emitted(&self) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue_failure(&self) {
        self.requeue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            requeue_failures: self.requeue_failures.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

/// A running session and its subscribers
struct Hub {
    sender: broadcast::Sender<StreamEvent>,
    cancel: Arc<AtomicBool>,
    subscribers: usize,
    /// Set by the worker, under the slot lock, when the session has ended
    finished: bool,
}

#[derive(Default)]
struct HubSlot {
    generation: u64,
    active: Option<Hub>,
}

/// Reference-counted frame source over one camera
pub struct CaptureSource<S: CameraSystem + 'static> {
    system: Arc<S>,
    config: CaptureConfig,
    context: Arc<SessionContext>,
    hub: Arc<Mutex<HubSlot>>,
}

impl<S: CameraSystem + 'static> CaptureSource<S> {
    pub fn new(system: Arc<S>, config: CaptureConfig) -> Result<Self, CaptureError> {
        config.validate()?;
        Ok(Self {
            system,
            context: Arc::new(SessionContext::new(&config)),
            config,
            hub: Arc::new(Mutex::new(HubSlot::default())),
        })
    }

    /// Subscribe to the frame stream, starting a session if none is running
    pub fn generate(&self) -> Result<FrameStream, CaptureError> {
        let mut slot = lock(&self.hub);
        let (mut hub, receiver) = match slot.active.take() {
            Some(hub) if !hub.finished => {
                let receiver = hub.sender.subscribe();
                (hub, receiver)
            }
            _ => {
                slot.generation += 1;
                self.start_session(slot.generation)?
            }
        };
        hub.subscribers += 1;
        debug!("Capture subscriber added ({} active)", hub.subscribers);
        slot.active = Some(hub);

        Ok(FrameStream {
            receiver,
            hub: Arc::clone(&self.hub),
            generation: slot.generation,
            finished: false,
        })
    }

    fn start_session(
        &self,
        generation: u64,
    ) -> Result<(Hub, broadcast::Receiver<StreamEvent>), CaptureError> {
        let (sender, receiver) = broadcast::channel(self.config.channel_capacity);
        let cancel = Arc::new(AtomicBool::new(false));
        let session = Session::new(
            Arc::clone(&self.system),
            self.config.clone(),
            Arc::clone(&self.context),
            Arc::clone(&cancel),
            sender.clone(),
        );

        let slot = Arc::clone(&self.hub);
        let terminal = sender.clone();
        std::thread::Builder::new()
            .name("capture-session".to_string())
            .spawn(move || {
                let event = match session.run() {
                    Ok(()) => StreamEvent::Closed,
                    Err(e) => StreamEvent::Failed(e),
                };
                let mut slot = lock(&slot);
                if slot.generation == generation {
                    if let Some(hub) = slot.active.as_mut() {
                        hub.finished = true;
                    }
                }
                let _ = terminal.send(event);
            })
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("failed to start capture worker: {}", e))
            })?;

        info!("Capture session {} starting", generation);
        Ok((
            Hub {
                sender,
                cancel,
                subscribers: 0,
                finished: false,
            },
            receiver,
        ))
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn set_exposure_time_ms(&self, value: f64) {
        self.context.parameters.set_exposure_time_ms(value);
    }

    pub fn set_frame_rate_fps(&self, value: f64) {
        self.context.parameters.set_frame_rate_fps(value);
    }

    pub fn set_black_level(&self, value: f64) {
        self.context.parameters.set_black_level(value);
    }

    pub fn set_gain(&self, value: f64) {
        self.context.parameters.set_gain(value);
    }

    pub fn set_gamma(&self, value: f64) {
        self.context.parameters.set_gamma(value);
    }

    pub fn set_use_max_frame_rate(&self, value: bool) {
        self.context.parameters.set_use_max_frame_rate(value);
    }

    /// Current parameters, including values resolved from hardware
    pub fn parameters(&self) -> AcquisitionParameters {
        self.context.parameters.snapshot()
    }

    /// Parameters written but not yet applied to the device
    pub fn pending_changes(&self) -> Pending {
        self.context.parameters.pending()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.context.state)
    }

    /// Limits from the most recent calibration
    pub fn calibration(&self) -> Option<CalibrationState> {
        *lock(&self.context.calibration)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }
}

/// One subscription to a capture source. Dropping it unsubscribes.
pub struct FrameStream {
    receiver: broadcast::Receiver<StreamEvent>,
    hub: Arc<Mutex<HubSlot>>,
    generation: u64,
    finished: bool,
}

impl FrameStream {
    /// Next frame, the terminal error, or `None` once the session has ended
    pub async fn next(&mut self) -> Option<Result<Arc<DataFrame>, CaptureError>> {
        while !self.finished {
            match self.receiver.recv().await {
                Ok(event) => return self.deliver(event),
                Err(RecvError::Lagged(skipped)) => lagged(skipped),
                Err(RecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    /// Blocking variant of [`next`](FrameStream::next) for use outside an
    /// async runtime
    pub fn blocking_next(&mut self) -> Option<Result<Arc<DataFrame>, CaptureError>> {
        while !self.finished {
            match self.receiver.blocking_recv() {
                Ok(event) => return self.deliver(event),
                Err(RecvError::Lagged(skipped)) => lagged(skipped),
                Err(RecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    fn deliver(&mut self, event: StreamEvent) -> Option<Result<Arc<DataFrame>, CaptureError>> {
        match event {
            StreamEvent::Frame(frame) => Some(Ok(frame)),
            StreamEvent::Closed => {
                self.finished = true;
                None
            }
            StreamEvent::Failed(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn lagged(skipped: u64) {
    warn!("Frame subscriber fell behind, skipped {} frames", skipped);
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let mut slot = lock(&self.hub);
        if slot.generation != self.generation {
            return;
        }
        let last = match slot.active.as_mut() {
            Some(hub) => {
                hub.subscribers = hub.subscribers.saturating_sub(1);
                hub.subscribers == 0
            }
            None => false,
        };
        if last {
            if let Some(hub) = slot.active.take() {
                hub.cancel.store(true, Ordering::SeqCst);
                debug!("Last capture subscriber left, cancelling session");
            }
        }
    }
}
