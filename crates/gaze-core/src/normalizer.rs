//! Head-pose normalisation of face-mesh eye landmarks.
//!
//! The first successful detection of a session becomes the reference pose.
//! Every later frame is expressed relative to it: eye rings are centred on
//! the face and rescaled by the change in face width, and the bounding-box
//! drift is appended as its own row.

use crate::detector::{DetectorError, LandmarkDetector};
use crate::types::{FeatureError, FeatureVector, Landmarks, ReferencePose};
use image::RgbImage;
use ndarray::Array2;
use thiserror::Error;

/// Face-mesh contour of the subject's left eye (image right after mirroring).
pub const FACEMESH_LEFT_EYE: [usize; 16] = [
    362, 382, 381, 380, 374, 373, 390, 249, 263, 466, 388, 387, 386, 385, 384, 398,
];

/// Face-mesh contour of the subject's right eye.
pub const FACEMESH_RIGHT_EYE: [usize; 16] = [
    33, 7, 163, 144, 145, 153, 154, 155, 133, 173, 157, 158, 159, 160, 161, 246,
];

/// Rows in a normalizer feature vector: both eye rings, scale row, offset row.
pub const FEATURE_ROWS: usize = FACEMESH_LEFT_EYE.len() + FACEMESH_RIGHT_EYE.len() + 2;

const SCALE_EPSILON: f64 = 1e-9;

/// Smallest landmark count the eye rings can index.
fn required_landmarks() -> usize {
    FACEMESH_LEFT_EYE
        .iter()
        .chain(FACEMESH_RIGHT_EYE.iter())
        .max()
        .map_or(0, |&i| i + 1)
}

/// Per-session normaliser. Not `Sync`-safe by contract: one instance per
/// tracking session, calls serialised by the owner.
#[derive(Debug, Default)]
pub struct FeatureNormalizer {
    reference: Option<ReferencePose>,
}

impl FeatureNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference(&self) -> Option<ReferencePose> {
        self.reference
    }

    /// Forget the reference pose; the next successful frame captures a new one.
    pub fn reset_reference(&mut self) {
        if self.reference.take().is_some() {
            tracing::debug!("reference pose cleared");
        }
    }

    /// Build the feature vector for one frame's landmarks.
    ///
    /// Captures the reference pose lazily on the first call after a reset.
    /// A landmark set too small for the eye rings is rejected without
    /// touching the reference.
    pub fn normalize(&mut self, landmarks: &Landmarks) -> Result<FeatureVector, FeatureError> {
        let required = required_landmarks();
        if landmarks.len() < required {
            return Err(FeatureError::TooFewLandmarks {
                required,
                actual: landmarks.len(),
            });
        }
        let bounds = landmarks.bounds().ok_or(FeatureError::Empty)?;

        let reference = *self.reference.get_or_insert_with(|| {
            let pose = ReferencePose::from(bounds);
            tracing::info!(
                origin_x = pose.origin_x,
                origin_y = pose.origin_y,
                width = pose.width,
                height = pose.height,
                "reference pose captured"
            );
            pose
        });

        let scale_x = reference.width / (bounds.width() + SCALE_EPSILON);
        let scale_y = reference.height / (bounds.height() + SCALE_EPSILON);
        let offset = (
            bounds.min_x - reference.origin_x,
            bounds.min_y - reference.origin_y,
        );
        let (cx, cy) = bounds.center();

        let mut features = Array2::<f64>::zeros((FEATURE_ROWS, 2));
        let eye_points = FACEMESH_LEFT_EYE
            .iter()
            .chain(FACEMESH_RIGHT_EYE.iter())
            .map(|&i| landmarks.points[i]);
        // Horizontal scale on both axes: distance is approximated from face width alone.
        for (row, (x, y)) in eye_points.enumerate() {
            features[[row, 0]] = (x - cx) * scale_x;
            features[[row, 1]] = (y - cy) * scale_x;
        }
        let scale_row = FEATURE_ROWS - 2;
        features[[scale_row, 0]] = scale_x;
        features[[scale_row, 1]] = scale_y;
        features[[scale_row + 1, 0]] = offset.0;
        features[[scale_row + 1, 1]] = offset.1;

        FeatureVector::from_array(features)
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmarks: {0}")]
    Landmarks(#[from] FeatureError),
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Landmark detector plus normaliser: frame in, feature vector out.
pub struct GazeExtractor<D> {
    detector: D,
    normalizer: FeatureNormalizer,
}

impl<D: LandmarkDetector> GazeExtractor<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            normalizer: FeatureNormalizer::new(),
        }
    }

    /// Extract features from a camera-oriented frame.
    ///
    /// The frame is mirrored horizontally first so landmarks match the
    /// user's "looking at yourself" orientation. `Ok(None)` means no face
    /// was found; the reference pose is left untouched in that case.
    pub fn extract(&mut self, frame: &RgbImage) -> Result<Option<FeatureVector>, ExtractError> {
        let mirrored = image::imageops::flip_horizontal(frame);
        let Some(landmarks) = self.detector.detect(&mirrored)? else {
            return Ok(None);
        };
        Ok(Some(self.normalizer.normalize(&landmarks)?))
    }

    /// [`extract`](Self::extract) against a caller-owned `normalizer`,
    /// for one-off images unrelated to the frame stream. This extractor's
    /// reference is untouched and the detector's tracking state is dropped.
    pub fn extract_detached(
        &mut self,
        normalizer: &mut FeatureNormalizer,
        frame: &RgbImage,
    ) -> Result<Option<FeatureVector>, ExtractError> {
        let mirrored = image::imageops::flip_horizontal(frame);
        let detected = self.detector.detect(&mirrored);
        self.detector.reset_tracking();
        let Some(landmarks) = detected? else {
            return Ok(None);
        };
        Ok(Some(normalizer.normalize(&landmarks)?))
    }

    /// Decode then [`extract`](Self::extract).
    pub fn extract_bytes(&mut self, bytes: &[u8]) -> Result<Option<FeatureVector>, ExtractError> {
        let frame = decode_frame(bytes)?;
        self.extract(&frame)
    }

    pub fn reset_reference(&mut self) {
        self.normalizer.reset_reference();
    }

    pub fn reference(&self) -> Option<ReferencePose> {
        self.normalizer.reference()
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 478 points on a grid spanning (100..=300, 50..=250) with the eye
    /// rings at known offsets.
    fn synthetic_face(dx: f64, dy: f64, scale: f64) -> Landmarks {
        let mut points = vec![(200.0, 150.0); 478];
        points[0] = (100.0, 50.0);
        points[1] = (300.0, 250.0);
        for (k, &i) in FACEMESH_LEFT_EYE.iter().enumerate() {
            points[i] = (230.0 + k as f64, 130.0 + (k % 4) as f64);
        }
        for (k, &i) in FACEMESH_RIGHT_EYE.iter().enumerate() {
            points[i] = (150.0 + k as f64, 130.0 + (k % 3) as f64);
        }
        let points = points
            .into_iter()
            .map(|(x, y)| ((x - 200.0) * scale + 200.0 + dx, (y - 150.0) * scale + 150.0 + dy))
            .collect();
        Landmarks::new(points)
    }

    #[test]
    fn test_first_frame_sets_reference() {
        let mut n = FeatureNormalizer::new();
        assert!(n.reference().is_none());
        let fv = n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();

        let r = n.reference().unwrap();
        assert_eq!((r.origin_x, r.origin_y, r.width, r.height), (100.0, 50.0, 200.0, 200.0));

        assert_eq!(fv.rows(), FEATURE_ROWS);
        let a = fv.as_array();
        assert!((a[[32, 0]] - 1.0).abs() < 1e-9);
        assert!((a[[32, 1]] - 1.0).abs() < 1e-9);
        assert_eq!(a[[33, 0]], 0.0);
        assert_eq!(a[[33, 1]], 0.0);
    }

    #[test]
    fn test_eye_points_centered_on_face() {
        let mut n = FeatureNormalizer::new();
        let fv = n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();
        let a = fv.as_array();
        // Left ring, first point: (230, 130) - centre (200, 150).
        assert!((a[[0, 0]] - 30.0).abs() < 1e-6);
        assert!((a[[0, 1]] + 20.0).abs() < 1e-6);
        // Right ring, first point: (150, 130).
        assert!((a[[16, 0]] + 50.0).abs() < 1e-6);
        assert!((a[[16, 1]] + 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_translation_reported_as_head_offset() {
        let mut n = FeatureNormalizer::new();
        let base = n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();
        let moved = n.normalize(&synthetic_face(12.0, -7.0, 1.0)).unwrap();

        let a = moved.as_array();
        assert!((a[[33, 0]] - 12.0).abs() < 1e-9);
        assert!((a[[33, 1]] + 7.0).abs() < 1e-9);
        // Centred eye rows are translation invariant.
        for row in 0..32 {
            assert!((a[[row, 0]] - base.as_array()[[row, 0]]).abs() < 1e-6);
            assert!((a[[row, 1]] - base.as_array()[[row, 1]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_closer_face_scales_down() {
        let mut n = FeatureNormalizer::new();
        let base = n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();
        let closer = n.normalize(&synthetic_face(0.0, 0.0, 2.0)).unwrap();

        let a = closer.as_array();
        assert!((a[[32, 0]] - 0.5).abs() < 1e-9);
        assert!((a[[32, 1]] - 0.5).abs() < 1e-9);
        // Doubled face, halved scale: eye rows match the reference frame.
        for row in 0..32 {
            assert!((a[[row, 0]] - base.as_array()[[row, 0]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_vertical_eye_axis_uses_horizontal_scale() {
        let mut n = FeatureNormalizer::new();
        n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();

        // Stretch only vertically: scale_y changes, scale_x stays 1.
        let stretched: Vec<(f64, f64)> = synthetic_face(0.0, 0.0, 1.0)
            .points
            .into_iter()
            .map(|(x, y)| (x, (y - 150.0) * 2.0 + 150.0))
            .collect();
        let fv = n.normalize(&Landmarks::new(stretched)).unwrap();
        let a = fv.as_array();
        assert!((a[[32, 0]] - 1.0).abs() < 1e-9);
        assert!((a[[32, 1]] - 0.5).abs() < 1e-9);
        // Left ring first point: y offset doubled to -40 and not rescaled by scale_y.
        assert!((a[[0, 1]] + 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_recaptures_reference() {
        let mut n = FeatureNormalizer::new();
        n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();
        n.reset_reference();
        assert!(n.reference().is_none());

        let fv = n.normalize(&synthetic_face(40.0, 10.0, 1.5)).unwrap();
        let r = n.reference().unwrap();
        assert!((r.origin_x - 90.0).abs() < 1e-9);
        assert!((r.origin_y - 10.0).abs() < 1e-9);
        assert!((r.width - 300.0).abs() < 1e-9);

        let a = fv.as_array();
        assert_eq!(a[[33, 0]], 0.0);
        assert_eq!(a[[33, 1]], 0.0);
        assert!((a[[32, 0]] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reference_survives_later_frames() {
        let mut n = FeatureNormalizer::new();
        n.normalize(&synthetic_face(0.0, 0.0, 1.0)).unwrap();
        let first = n.reference();
        n.normalize(&synthetic_face(25.0, 25.0, 0.8)).unwrap();
        assert_eq!(n.reference(), first);
    }

    #[test]
    fn test_too_few_landmarks_rejected_without_reference() {
        let mut n = FeatureNormalizer::new();
        let err = n
            .normalize(&Landmarks::new(vec![(1.0, 1.0); 68]))
            .unwrap_err();
        assert_eq!(
            err,
            FeatureError::TooFewLandmarks { required: 467, actual: 68 }
        );
        assert!(n.reference().is_none());
    }

    #[test]
    fn test_degenerate_face_does_not_divide_by_zero() {
        let mut n = FeatureNormalizer::new();
        let fv = n.normalize(&Landmarks::new(vec![(5.0, 5.0); 468])).unwrap();
        assert!(fv.flatten().iter().all(|v| v.is_finite()));
    }

    struct OneFace {
        face: Landmarks,
        resets: usize,
    }

    impl LandmarkDetector for OneFace {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Option<Landmarks>, DetectorError> {
            Ok(Some(self.face.clone()))
        }

        fn reset_tracking(&mut self) {
            self.resets += 1;
        }
    }

    #[test]
    fn test_detached_extract_leaves_stream_reference_alone() {
        let mut extractor = GazeExtractor::new(OneFace {
            face: synthetic_face(0.0, 0.0, 1.0),
            resets: 0,
        });
        extractor.extract(&RgbImage::new(4, 4)).unwrap();
        let stream_ref = extractor.reference();

        extractor.detector_mut().face = synthetic_face(60.0, 30.0, 1.2);
        let mut side = FeatureNormalizer::new();
        let fv = extractor
            .extract_detached(&mut side, &RgbImage::new(4, 4))
            .unwrap()
            .unwrap();

        assert_eq!(extractor.reference(), stream_ref);
        assert_ne!(side.reference(), stream_ref);
        assert_eq!(fv.as_array()[[33, 0]], 0.0);
        assert_eq!(extractor.detector_mut().resets, 1);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(matches!(
            decode_frame(b"definitely not an image"),
            Err(ExtractError::Decode(_))
        ));
    }
}
