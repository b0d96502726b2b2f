//! On-disk calibration format.
//!
//! A versioned JSON container holding both regressors, the fitted flag and a
//! SHA-256 checksum over their canonical little-endian encoding. Sample
//! history is not persisted. Writes go through a sibling temp file and a
//! rename so a failed save never truncates an existing calibration.

use crate::calibration::{CalibrationModel, FitState};
use crate::ridge::{self, RidgeRegressor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FORMAT_TAG: &str = "gaze-calibration";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed calibration file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a calibration file (format tag {0:?})")]
    UnsupportedFormat(String),
    #[error("unsupported calibration file version {0} (this build reads {FORMAT_VERSION})")]
    UnsupportedVersion(u64),
    #[error("checksum mismatch: file says {stored}, content hashes to {computed}")]
    ChecksumMismatch { stored: String, computed: String },
    #[error("invalid calibration file: {0}")]
    Invalid(String),
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the file simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    format: String,
    version: u32,
    created_at: DateTime<Utc>,
    alpha: f64,
    fitted: bool,
    reg_x: Option<RidgeRegressor>,
    reg_y: Option<RidgeRegressor>,
    checksum: String,
}

/// Summary of a calibration file, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationInfo {
    pub format: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub alpha: f64,
    pub fitted: bool,
    pub feature_dim: Option<usize>,
}

fn checksum(fitted: bool, alpha: f64, reg_x: Option<&RidgeRegressor>, reg_y: Option<&RidgeRegressor>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FORMAT_TAG.as_bytes());
    hasher.update([fitted as u8]);
    hasher.update(alpha.to_le_bytes());
    for reg in [reg_x, reg_y] {
        match reg {
            None => hasher.update([0u8]),
            Some(r) => {
                hasher.update([1u8]);
                hasher.update(r.alpha.to_le_bytes());
                hasher.update((r.coefficients.len() as u64).to_le_bytes());
                for w in &r.coefficients {
                    hasher.update(w.to_le_bytes());
                }
                hasher.update(r.intercept.to_le_bytes());
            }
        }
    }
    format!("{:x}", hasher.finalize())
}

pub(crate) fn save(model: &CalibrationModel, path: &Path) -> Result<(), PersistError> {
    let (reg_x, reg_y) = match model.fit_state() {
        FitState::Trained { reg_x, reg_y } => (Some(reg_x.clone()), Some(reg_y.clone())),
        FitState::Untrained => (None, None),
    };
    let fitted = model.is_fitted();
    let file = CalibrationFile {
        format: FORMAT_TAG.to_string(),
        version: FORMAT_VERSION,
        created_at: Utc::now(),
        alpha: model.alpha(),
        fitted,
        checksum: checksum(fitted, model.alpha(), reg_x.as_ref(), reg_y.as_ref()),
        reg_x,
        reg_y,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    let result = write_json(&tmp, &file).and_then(|()| {
        fs::rename(&tmp, path).map_err(|e| PersistError::io(path, e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    tracing::info!(path = %path.display(), fitted, "calibration saved");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_json(path: &Path, file: &CalibrationFile) -> Result<(), PersistError> {
    let f = fs::File::create(path).map_err(|e| PersistError::io(path, e))?;
    let mut writer = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut writer, file)?;
    writer.flush().map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

/// Read, version-check and verify a calibration file.
fn read_file(path: &Path) -> Result<CalibrationFile, PersistError> {
    let text = fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;

    // Check the header before committing to this version's schema.
    let value: serde_json::Value = serde_json::from_str(&text)?;
    let format = value.get("format").and_then(|v| v.as_str()).unwrap_or_default();
    if format != FORMAT_TAG {
        return Err(PersistError::UnsupportedFormat(format.to_string()));
    }
    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| PersistError::Invalid("missing version".into()))?;
    if version != FORMAT_VERSION as u64 {
        return Err(PersistError::UnsupportedVersion(version));
    }

    let file: CalibrationFile = serde_json::from_value(value)?;
    let computed = checksum(file.fitted, file.alpha, file.reg_x.as_ref(), file.reg_y.as_ref());
    if computed != file.checksum {
        return Err(PersistError::ChecksumMismatch {
            stored: file.checksum,
            computed,
        });
    }
    Ok(file)
}

pub(crate) fn load(path: &Path) -> Result<CalibrationModel, PersistError> {
    let file = read_file(path)?;
    ridge::validate_alpha(file.alpha).map_err(|e| PersistError::Invalid(e.to_string()))?;

    let fit = if file.fitted {
        let (Some(reg_x), Some(reg_y)) = (file.reg_x, file.reg_y) else {
            return Err(PersistError::Invalid(
                "marked fitted but a regressor is missing".into(),
            ));
        };
        if reg_x.n_features() == 0 || reg_x.n_features() != reg_y.n_features() {
            return Err(PersistError::Invalid(format!(
                "regressor widths differ or are empty ({} vs {})",
                reg_x.n_features(),
                reg_y.n_features()
            )));
        }
        FitState::Trained { reg_x, reg_y }
    } else {
        FitState::Untrained
    };

    tracing::info!(path = %path.display(), fitted = file.fitted, "calibration loaded");
    Ok(CalibrationModel::from_parts(file.alpha, fit))
}

/// Read a calibration file's header without building a model.
pub fn inspect(path: impl AsRef<Path>) -> Result<CalibrationInfo, PersistError> {
    let file = read_file(path.as_ref())?;
    Ok(CalibrationInfo {
        feature_dim: file.reg_x.as_ref().map(RidgeRegressor::n_features),
        format: file.format,
        version: file.version,
        created_at: file.created_at,
        alpha: file.alpha,
        fitted: file.fitted,
    })
}
