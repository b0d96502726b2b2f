use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod schedule;

use config::Config;
use dbus_interface::{GazeService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gazed starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        calibration = %config.calibration_path.display(),
        "configuration loaded"
    );

    let model_path = config.facemesh_model_path();
    let detector = gaze_core::FaceMeshDetector::load(&model_path, config.min_presence)
        .with_context(|| format!("loading face-mesh model {model_path}"))?;

    let engine = engine::spawn_engine(config, detector)?;

    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, GazeService::new(engine.clone()))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "gazed ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("gazed shutting down");
    if let Err(e) = engine.stop_session().await {
        tracing::warn!(error = %e, "failed to stop session cleanly");
    }

    Ok(())
}
