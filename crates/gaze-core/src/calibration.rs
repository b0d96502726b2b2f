//! Per-user gaze calibration: two independent ridge regressions, one per
//! screen axis, trained on accumulated (features, target) pairs.
//!
//! Samples only ever grow (or are cleared by [`CalibrationModel::reset`]).
//! Every `fit` retrains on the full history. Until a fit succeeds with
//! enough samples, `predict` returns the screen centre.

use crate::persist::{self, PersistError};
use crate::ridge::{self, RidgeError, RidgeRegressor};
use crate::types::{clip_unit, FeatureVector, GazePoint};
use ndarray::{Array1, Array2};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_RIDGE_ALPHA: f64 = 0.5;
pub const MIN_FIT_SAMPLES: usize = 3;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("feature vector has {actual} values, calibration expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("ridge: {0}")]
    Ridge(#[from] RidgeError),
    #[error("persistence: {0}")]
    Persist(#[from] PersistError),
}

/// One accumulated training pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSample {
    pub features: Vec<f64>,
    pub target_x: f64,
    pub target_y: f64,
}

/// Trained-or-not, as a variant: stale weights cannot outlive an
/// under-sampled refit.
#[derive(Debug, Clone, PartialEq)]
pub enum FitState {
    Untrained,
    Trained {
        reg_x: RidgeRegressor,
        reg_y: RidgeRegressor,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// No samples, not fitted.
    Empty,
    /// Samples present but no usable fit.
    Accumulating,
    Fitted,
}

#[derive(Debug, Clone)]
pub struct CalibrationModel {
    alpha: f64,
    samples: Vec<CalibrationSample>,
    fit: FitState,
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_RIDGE_ALPHA,
            samples: Vec::new(),
            fit: FitState::Untrained,
        }
    }
}

impl CalibrationModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alpha(alpha: f64) -> Result<Self, CalibrationError> {
        ridge::validate_alpha(alpha)?;
        Ok(Self {
            alpha,
            ..Self::default()
        })
    }

    /// Rebuild a model from persisted parts (no sample history).
    pub(crate) fn from_parts(alpha: f64, fit: FitState) -> Self {
        Self {
            alpha,
            samples: Vec::new(),
            fit,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn fit_state(&self) -> &FitState {
        &self.fit
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.fit, FitState::Trained { .. })
    }

    pub fn state(&self) -> CalibrationState {
        if self.is_fitted() {
            CalibrationState::Fitted
        } else if self.samples.is_empty() {
            CalibrationState::Empty
        } else {
            CalibrationState::Accumulating
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    /// Flattened feature width this model is locked to, if any.
    pub fn feature_dim(&self) -> Option<usize> {
        match &self.fit {
            FitState::Trained { reg_x, .. } => Some(reg_x.n_features()),
            FitState::Untrained => self.samples.first().map(|s| s.features.len()),
        }
    }

    fn check_dim(&self, actual: usize) -> Result<(), CalibrationError> {
        match self.feature_dim() {
            Some(expected) if expected != actual => {
                Err(CalibrationError::ShapeMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Append a training pair. Targets are expected in [0, 1] but not checked.
    pub fn add(
        &mut self,
        features: &FeatureVector,
        target_x: f64,
        target_y: f64,
    ) -> Result<(), CalibrationError> {
        self.check_dim(features.dim())?;
        self.samples.push(CalibrationSample {
            features: features.flatten(),
            target_x,
            target_y,
        });
        Ok(())
    }

    /// Retrain both axes on every accumulated sample.
    ///
    /// Returns `Ok(false)` and drops any previous fit when fewer than
    /// [`MIN_FIT_SAMPLES`] samples exist. On a ridge failure the previous
    /// fit is kept and the error returned.
    pub fn fit(&mut self) -> Result<bool, CalibrationError> {
        let n = self.samples.len();
        if n < MIN_FIT_SAMPLES {
            tracing::debug!(samples = n, required = MIN_FIT_SAMPLES, "not enough samples to fit");
            self.fit = FitState::Untrained;
            return Ok(false);
        }

        let dim = self.samples[0].features.len();
        let mut design = Array2::<f64>::zeros((n, dim));
        for (mut row, sample) in design.rows_mut().into_iter().zip(&self.samples) {
            row.assign(&ndarray::ArrayView1::from(sample.features.as_slice()));
        }
        let tx: Array1<f64> = self.samples.iter().map(|s| s.target_x).collect();
        let ty: Array1<f64> = self.samples.iter().map(|s| s.target_y).collect();

        let reg_x = RidgeRegressor::fit(design.view(), tx.view(), self.alpha)?;
        let reg_y = RidgeRegressor::fit(design.view(), ty.view(), self.alpha)?;
        self.fit = FitState::Trained { reg_x, reg_y };

        tracing::info!(samples = n, features = dim, alpha = self.alpha, "calibration fitted");
        Ok(true)
    }

    /// Normalised gaze for `features`, clipped to the screen.
    ///
    /// Unfitted models return [`GazePoint::CENTER`] for any input.
    pub fn predict(&self, features: &FeatureVector) -> Result<GazePoint, CalibrationError> {
        let FitState::Trained { reg_x, reg_y } = &self.fit else {
            return Ok(GazePoint::CENTER);
        };
        self.check_dim(features.dim())?;
        let row = features.flatten();
        Ok(GazePoint {
            x_norm: clip_unit(reg_x.predict(&row)),
            y_norm: clip_unit(reg_y.predict(&row)),
        })
    }

    /// Clear samples and any fit.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.fit = FitState::Untrained;
    }

    /// Persist the trained regressors (not the sample history).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        persist::save(self, path.as_ref())?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        Ok(persist::load(path.as_ref())?)
    }
}
