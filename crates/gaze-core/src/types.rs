use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of columns in every feature vector row: (x, y).
pub const FEATURE_COLUMNS: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("feature vector must have 2 columns, got {0}")]
    Columns(usize),
    #[error("feature vector has no rows")]
    Empty,
    #[error("flat feature vector length {0} is not a multiple of 2")]
    OddLength(usize),
    #[error("landmark set has {actual} points, eye rings need at least {required}")]
    TooFewLandmarks { required: usize, actual: usize },
}

/// One frame's facial landmarks in (mirrored) image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub points: Vec<(f64, f64)>,
}

impl Landmarks {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Axis-aligned bounding box of every landmark, `None` for an empty set.
    pub fn bounds(&self) -> Option<FaceBounds> {
        let (&(x0, y0), rest) = self.points.split_first()?;
        let mut b = FaceBounds {
            min_x: x0,
            max_x: x0,
            min_y: y0,
            max_y: y0,
        };
        for &(x, y) in rest {
            b.min_x = b.min_x.min(x);
            b.max_x = b.max_x.max(x);
            b.min_y = b.min_y.min(y);
            b.max_y = b.max_y.max(y);
        }
        Some(b)
    }
}

/// Bounding box of a landmark set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl FaceBounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

/// Face bounding box captured on the first detection of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePose {
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<FaceBounds> for ReferencePose {
    fn from(b: FaceBounds) -> Self {
        Self {
            origin_x: b.min_x,
            origin_y: b.min_y,
            width: b.width(),
            height: b.height(),
        }
    }
}

/// Fixed-shape `rows × 2` feature matrix.
///
/// Row order for normalizer output: left-eye ring, right-eye ring,
/// `[scale_x, scale_y]`, head offset. Calibration flattens it row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Array2<f64>);

impl FeatureVector {
    pub fn from_array(array: Array2<f64>) -> Result<Self, FeatureError> {
        if array.ncols() != FEATURE_COLUMNS {
            return Err(FeatureError::Columns(array.ncols()));
        }
        if array.nrows() == 0 {
            return Err(FeatureError::Empty);
        }
        Ok(Self(array))
    }

    pub fn from_rows(rows: &[(f64, f64)]) -> Result<Self, FeatureError> {
        let flat: Vec<f64> = rows.iter().flat_map(|&(x, y)| [x, y]).collect();
        Self::from_flat(&flat)
    }

    /// Rebuild a feature vector from its flattened form (e.g. received over IPC).
    pub fn from_flat(values: &[f64]) -> Result<Self, FeatureError> {
        if values.is_empty() {
            return Err(FeatureError::Empty);
        }
        if values.len() % FEATURE_COLUMNS != 0 {
            return Err(FeatureError::OddLength(values.len()));
        }
        let rows = values.len() / FEATURE_COLUMNS;
        let array = Array2::from_shape_vec((rows, FEATURE_COLUMNS), values.to_vec())
            .map_err(|_| FeatureError::OddLength(values.len()))?;
        Ok(Self(array))
    }

    pub fn rows(&self) -> usize {
        self.0.nrows()
    }

    /// Length of the flattened vector.
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Row-major single row, the layout both `add` and `predict` consume.
    pub fn flatten(&self) -> Vec<f64> {
        self.0.iter().copied().collect()
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.0
    }
}

/// Screen size in pixels, used to turn normalised gaze into pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

/// Normalised gaze position, both axes in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazePoint {
    pub x_norm: f64,
    pub y_norm: f64,
}

impl GazePoint {
    /// Returned by an unfitted model.
    pub const CENTER: GazePoint = GazePoint {
        x_norm: 0.5,
        y_norm: 0.5,
    };

    pub fn to_pixels(&self, screen: ScreenSize) -> (f64, f64) {
        (
            self.x_norm * screen.width as f64,
            self.y_norm * screen.height as f64,
        )
    }
}

/// Clamp to [0, 1]. NaN maps to the centre.
pub fn clip_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.5
    } else {
        value.clamp(0.0, 1.0)
    }
}
