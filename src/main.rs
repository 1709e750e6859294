//! camfleet service entry point

use std::sync::Arc;

use camfleet::capture::{FfmpegCapture, Frame};
use camfleet::config::AppConfig;
use camfleet::discovery::CameraDiscovery;
use camfleet::endpoint::EndpointSelector;
use camfleet::manager::CameraManager;
use camfleet::worker::FrameSink;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in sink until vision consumers are attached.
struct LogFrameSink;

impl FrameSink for LogFrameSink {
    fn on_frame(&self, camera_ip: &str, frame: Frame) -> camfleet::Result<()> {
        tracing::debug!(
            camera_ip = %camera_ip,
            width = frame.width,
            height = frame.height,
            "Frame received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camfleet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camfleet v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        subnets = ?config.scan_subnets,
        ws_discovery = config.ws_discovery_enabled,
        interval_sec = config.discovery_interval.as_secs(),
        templates = config.rtsp_paths.len(),
        "Configuration loaded"
    );

    match FfmpegCapture::check_ffmpeg().await {
        Ok(version) => tracing::info!(version = %version, "ffmpeg available"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg missing, stream capture will fail"),
    }

    tracing::info!(
        path = %config.sessions_file.display(),
        "Capture session document path (shared with the labeling workflow)"
    );

    let opener = Arc::new(FfmpegCapture::new());
    let discovery = Arc::new(CameraDiscovery::new(
        config.scan_subnets.clone(),
        config.ws_discovery_enabled,
        config.discovery_timeout,
    ));
    let selector = Arc::new(EndpointSelector::new(
        config.rtsp_paths.clone(),
        config.camera_username.clone(),
        config.camera_password.clone(),
        opener.clone(),
    ));

    let manager = CameraManager::new(discovery, selector, opener, Arc::new(LogFrameSink));
    manager.start(config.discovery_interval).await;
    tracing::info!("Camera manager started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    manager.stop().await;

    Ok(())
}
