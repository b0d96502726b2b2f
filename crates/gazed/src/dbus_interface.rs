use crate::engine::{EngineError, EngineHandle};
use gaze_core::calibration::CalibrationError;
use gaze_core::ExtractError;
use serde::Serialize;
use std::path::PathBuf;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.freedesktop.Gaze1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Gaze1";

/// D-Bus interface for the gaze daemon.
///
/// Bus name: org.freedesktop.Gaze1
/// Object path: /org/freedesktop/Gaze1
///
/// Composite replies are JSON strings.
pub struct GazeService {
    engine: EngineHandle,
}

impl GazeService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

/// Empty string means "use the configured path".
fn optional_path(path: &str) -> Option<PathBuf> {
    (!path.is_empty()).then(|| PathBuf::from(path))
}

fn to_fdo(err: EngineError) -> fdo::Error {
    let msg = err.to_string();
    match err {
        EngineError::Extract(ExtractError::Decode(_))
        | EngineError::Features(_)
        | EngineError::Calibration(CalibrationError::ShapeMismatch { .. }) => {
            fdo::Error::InvalidArgs(msg)
        }
        EngineError::Calibration(CalibrationError::Persist(e)) if e.is_not_found() => {
            fdo::Error::FileNotFound(msg)
        }
        EngineError::Calibration(CalibrationError::Persist(_)) => fdo::Error::IOError(msg),
        _ => fdo::Error::Failed(msg),
    }
}

#[interface(name = "org.freedesktop.Gaze1")]
impl GazeService {
    /// Open the camera and start calibrating or tracking.
    async fn start_session(&self) -> fdo::Result<String> {
        tracing::info!("start_session requested");
        let status = self.engine.start_session().await.map_err(to_fdo)?;
        to_json(&status)
    }

    async fn stop_session(&self) -> fdo::Result<bool> {
        tracing::info!("stop_session requested");
        self.engine.stop_session().await.map_err(to_fdo)
    }

    /// Newest estimate since the last call, or `null`.
    async fn current_gaze(&self) -> fdo::Result<String> {
        to_json(&self.engine.current_gaze())
    }

    /// Gaze for one encoded image (JPEG, PNG, ...).
    async fn predict(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "predict requested");
        let reply = self.engine.predict(image).await.map_err(to_fdo)?;
        to_json(&reply)
    }

    async fn predict_features(&self, features: Vec<f64>) -> fdo::Result<String> {
        let reply = self
            .engine
            .predict_features(features)
            .await
            .map_err(to_fdo)?;
        to_json(&reply)
    }

    async fn extract_features(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "extract_features requested");
        let reply = self
            .engine
            .extract_features(image)
            .await
            .map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Returns the sample count after adding.
    async fn add_sample(&self, features: Vec<f64>, x: f64, y: f64) -> fdo::Result<u32> {
        let count = self
            .engine
            .add_sample(features, x, y)
            .await
            .map_err(to_fdo)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn fit(&self) -> fdo::Result<String> {
        tracing::info!("fit requested");
        let reply = self.engine.fit().await.map_err(to_fdo)?;
        to_json(&reply)
    }

    async fn reset_reference(&self) -> fdo::Result<()> {
        tracing::info!("reset_reference requested");
        self.engine.reset_reference().await.map_err(to_fdo)
    }

    /// Save the fitted calibration; returns the path written.
    async fn save(&self, path: &str) -> fdo::Result<String> {
        tracing::info!(path, "save requested");
        let written = self
            .engine
            .save(optional_path(path))
            .await
            .map_err(to_fdo)?;
        Ok(written.display().to_string())
    }

    async fn load(&self, path: &str) -> fdo::Result<String> {
        tracing::info!(path, "load requested");
        let reply = self
            .engine
            .load(optional_path(path))
            .await
            .map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}
