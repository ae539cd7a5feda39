//! Camera Capture Application
//!
//! Wires a capture source to the process: logging, optional Prometheus
//! exporter, and a consume loop that reports throughput until shutdown.

use acquisition::{CaptureError, CaptureSource, SessionState};
use camera_device::CameraSystem;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Longest wait for the device to be released after the stream ends
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Metrics exporter failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Process-level settings from the `[app]` table of the config file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Serve Prometheus metrics on this address
    pub metrics_listen: Option<SocketAddr>,
    pub report_interval_secs: u64,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            metrics_listen: None,
            report_interval_secs: 5,
            max_frames: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    app: AppSettings,
}

impl AppSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let file: SettingsFile = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .build()?
            .try_deserialize()?;
        Ok(file.app)
    }
}

/// Initialize logging, honoring `RUST_LOG`
pub fn init_logging() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Install the Prometheus exporter. Must be called inside a tokio runtime.
pub fn install_metrics(addr: SocketAddr) -> Result<(), AppError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}

fn report<S: CameraSystem + 'static>(source: &CaptureSource<S>, frames: u64, since: Instant) {
    let fps = frames as f64 / since.elapsed().as_secs_f64().max(f64::EPSILON);
    let params = source.parameters();
    let stats = source.stats();
    info!(
        "{:.1} fps received (set {:.2} fps, exposure {} ms), {} emitted, {} dropped",
        fps, params.frame_rate_fps, params.exposure_time_ms, stats.frames_emitted, stats.frames_dropped
    );
    if let Some(calibration) = source.calibration() {
        info!(
            "Limits: real {:.2} fps, theoretical {:.2} fps, ceiling {:.2} fps",
            calibration.real_max, calibration.theoretical_max, calibration.device_ceiling
        );
    }
}

/// Consume frames until `shutdown` resolves, the stream ends or
/// `max_frames` is reached. Returns the number of frames received.
pub async fn run_capture<S, F>(
    source: &CaptureSource<S>,
    settings: &AppSettings,
    shutdown: F,
) -> Result<u64, AppError>
where
    S: CameraSystem + 'static,
    F: Future<Output = ()>,
{
    let mut stream = source.generate()?;
    let mut ticker = tokio::time::interval(Duration::from_secs(settings.report_interval_secs.max(1)));
    // First tick fires immediately
    ticker.tick().await;
    tokio::pin!(shutdown);

    let mut total = 0u64;
    let mut window = 0u64;
    let mut window_start = Instant::now();
    let result = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break Ok(total);
            }
            _ = ticker.tick() => {
                report(source, window, window_start);
                window = 0;
                window_start = Instant::now();
            }
            item = stream.next() => match item {
                Some(Ok(_frame)) => {
                    total += 1;
                    window += 1;
                    if settings.max_frames.is_some_and(|max| total >= max) {
                        break Ok(total);
                    }
                }
                Some(Err(e)) => break Err(AppError::from(e)),
                None => {
                    warn!("Capture stream closed");
                    break Ok(total);
                }
            },
        }
    };

    drop(stream);
    wait_for_teardown(source).await;
    result
}

async fn wait_for_teardown<S: CameraSystem + 'static>(source: &CaptureSource<S>) {
    let start = Instant::now();
    while source.state() != SessionState::Closed {
        if start.elapsed() > TEARDOWN_TIMEOUT {
            warn!("Capture session still {:?} after {:?}", source.state(), TEARDOWN_TIMEOUT);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
