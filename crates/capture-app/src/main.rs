//! Vimba Capture - Main Entry Point

use acquisition::{CaptureConfig, CaptureSource};
use capture_app::{init_logging, install_metrics, run_capture, AppSettings};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(feature = "vimba")]
fn camera_system() -> camera_device::VimbaSystem {
    camera_device::VimbaSystem::new()
}

#[cfg(not(feature = "vimba"))]
fn camera_system() -> camera_device::SimulatedSystem {
    info!("Built without `vimba`, capturing from the simulated camera");
    camera_device::SimulatedSystem::single(camera_device::SimulatedModel::default())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    info!("=== Vimba Capture v{} ===", env!("CARGO_PKG_VERSION"));

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "capture.toml".to_string());
    let config = CaptureConfig::load(&path)?;
    let settings = AppSettings::load(&path)?;
    info!("Loaded configuration from {}: {:?}", path, config);

    if let Some(addr) = settings.metrics_listen {
        install_metrics(addr)?;
    }

    let source = CaptureSource::new(Arc::new(camera_system()), config)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let frames = run_capture(&source, &settings, shutdown).await?;
    info!("Captured {} frames", frames);
    Ok(())
}
