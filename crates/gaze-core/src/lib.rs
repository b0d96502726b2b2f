//! gaze-core: gaze estimation engine.
//!
//! Turns face-mesh landmarks into a head-motion compensated feature vector
//! and maps it to normalised screen coordinates with a per-user ridge
//! calibration. The landmark model runs via ONNX Runtime on the CPU.

pub mod calibration;
pub mod detector;
pub mod normalizer;
pub mod persist;
pub mod ridge;
pub mod types;

pub use calibration::{CalibrationError, CalibrationModel, CalibrationState};
pub use detector::{DetectorError, FaceMeshDetector, LandmarkDetector};
pub use normalizer::{decode_frame, ExtractError, FeatureNormalizer, GazeExtractor};
pub use persist::{inspect, CalibrationInfo, PersistError};
pub use types::{FeatureVector, GazePoint, Landmarks, ReferencePose, ScreenSize};

use std::path::PathBuf;

/// Directory holding the face-mesh ONNX model.
///
/// `GAZE_MODEL_DIR` overrides the packaged location.
pub fn default_model_dir() -> PathBuf {
    std::env::var("GAZE_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/share/gaze/models"))
}
