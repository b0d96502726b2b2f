//! Face-mesh landmark detector via ONNX Runtime.
//!
//! Runs the 468/478-point face-mesh landmark model on a letterboxed region
//! of interest. In tracking mode the previous frame's landmarks define the
//! next region, so only the first frame (or a lost track) pays for a
//! full-frame pass.

use crate::types::Landmarks;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const FACEMESH_INPUT_SIZE: u32 = 192;
const FACEMESH_MEAN: f32 = 127.5;
const FACEMESH_STD: f32 = 127.5;
const FACEMESH_MIN_POINTS: usize = 468;
const FACEMESH_VALUES_PER_POINT: usize = 3;
const FACEMESH_PAD_VALUE: u8 = 0;
/// Fraction of the landmark box added on every side for the tracking ROI.
const ROI_EXPANSION: f64 = 0.25;

pub const DEFAULT_MIN_PRESENCE: f32 = 0.5;
pub const FACEMESH_MODEL_FILE: &str = "face_landmark.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place face_landmark.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Black-box landmark source: an RGB frame in, one face's landmarks out.
///
/// `Ok(None)` is the normal "no face in this frame" outcome.
pub trait LandmarkDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Option<Landmarks>, DetectorError>;

    /// Forget any frame-to-frame tracking state.
    fn reset_tracking(&mut self) {}
}

impl<T: LandmarkDetector + ?Sized> LandmarkDetector for Box<T> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Option<Landmarks>, DetectorError> {
        (**self).detect(frame)
    }

    fn reset_tracking(&mut self) {
        (**self).reset_tracking()
    }
}

/// Square crop region in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Roi {
    x: f64,
    y: f64,
    size: f64,
}

impl Roi {
    fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            size: width.max(height) as f64,
        }
    }

    /// Square ROI around landmarks, expanded on every side.
    fn around(landmarks: &Landmarks) -> Option<Self> {
        let b = landmarks.bounds()?;
        let side = b.width().max(b.height()) * (1.0 + 2.0 * ROI_EXPANSION);
        if side <= 0.0 {
            return None;
        }
        let (cx, cy) = b.center();
        Some(Self {
            x: cx - side / 2.0,
            y: cy - side / 2.0,
            size: side,
        })
    }
}

/// Metadata for mapping model-space coordinates back to the frame.
struct LetterboxInfo {
    roi: Roi,
    /// Model pixels per frame pixel.
    scale: f64,
}

impl LetterboxInfo {
    fn to_frame(&self, mx: f64, my: f64) -> (f64, f64) {
        (self.roi.x + mx / self.scale, self.roi.y + my / self.scale)
    }
}

/// Face-mesh ONNX landmark detector.
pub struct FaceMeshDetector {
    session: Session,
    min_presence: f32,
    roi: Option<Roi>,
}

impl FaceMeshDetector {
    /// Load the face-mesh ONNX model from the given path.
    pub fn load(model_path: &str, min_presence: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            min_presence,
            "loaded face-mesh model"
        );

        Ok(Self {
            session,
            min_presence,
            roi: None,
        })
    }

    fn run(&mut self, frame: &RgbImage, roi: Roi) -> Result<Option<Landmarks>, DetectorError> {
        let (input, letterbox) = preprocess(frame, roi);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        if outputs.len() > 1 {
            let (_, presence) = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("presence score: {e}")))?;
            let score = presence.first().copied().map(sigmoid).unwrap_or(0.0);
            if score < self.min_presence {
                tracing::debug!(score, "face-mesh presence below threshold");
                return Ok(None);
            }
        }

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("landmarks: {e}")))?;

        decode_landmarks(raw, &letterbox).map(Some)
    }
}

impl LandmarkDetector for FaceMeshDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Option<Landmarks>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(None);
        }

        let mut found = None;
        if let Some(roi) = self.roi {
            found = self.run(frame, roi)?;
            if found.is_none() {
                tracing::debug!("track lost, retrying on full frame");
            }
        }
        if found.is_none() {
            found = self.run(frame, Roi::full_frame(frame.width(), frame.height()))?;
        }

        self.roi = found.as_ref().and_then(Roi::around);
        Ok(found)
    }

    /// Drop the tracking ROI so the next frame runs on the full image.
    fn reset_tracking(&mut self) {
        self.roi = None;
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Crop `roi` (padding outside the frame), resize to the model input and
/// normalise into an NHWC float tensor in [-1, 1].
fn preprocess(frame: &RgbImage, roi: Roi) -> (Array4<f32>, LetterboxInfo) {
    let side = roi.size.round().max(1.0) as u32;
    let mut canvas = RgbImage::from_pixel(side, side, image::Rgb([FACEMESH_PAD_VALUE; 3]));
    imageops::replace(
        &mut canvas,
        frame,
        -(roi.x.round() as i64),
        -(roi.y.round() as i64),
    );

    let size = FACEMESH_INPUT_SIZE;
    let resized = imageops::resize(&canvas, size, size, imageops::FilterType::Triangle);

    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, n, n, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - FACEMESH_MEAN) / FACEMESH_STD;
        }
    }

    let letterbox = LetterboxInfo {
        roi: Roi {
            x: roi.x.round(),
            y: roi.y.round(),
            size: side as f64,
        },
        scale: size as f64 / side as f64,
    };
    (tensor, letterbox)
}

/// Decode `[x, y, z]` triples in model pixels into frame-space landmarks.
fn decode_landmarks(raw: &[f32], letterbox: &LetterboxInfo) -> Result<Landmarks, DetectorError> {
    let count = raw.len() / FACEMESH_VALUES_PER_POINT;
    if count < FACEMESH_MIN_POINTS {
        return Err(DetectorError::InferenceFailed(format!(
            "expected at least {FACEMESH_MIN_POINTS} landmarks, got {count}"
        )));
    }

    let points = raw
        .chunks_exact(FACEMESH_VALUES_PER_POINT)
        .map(|p| letterbox.to_frame(p[0] as f64, p[1] as f64))
        .collect();
    Ok(Landmarks::new(points))
}
