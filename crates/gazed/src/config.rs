use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Defaults ---
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_SCREEN_WIDTH: u32 = 1920;
const DEFAULT_SCREEN_HEIGHT: u32 = 1080;
const DEFAULT_FRAMES_PER_TARGET: usize = 25;
const DEFAULT_GRID_SIZE: usize = 4;
const DEFAULT_WARMUP_FRAMES: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration: defaults, then the TOML file, then `GAZE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing `face_landmark.onnx`.
    pub model_dir: PathBuf,
    /// Where Save/Load go when no explicit path is given.
    pub calibration_path: PathBuf,
    pub ridge_alpha: f64,
    pub screen_width: u32,
    pub screen_height: u32,
    /// Processed frames spent on each calibration target.
    pub frames_per_target: usize,
    /// Calibration grid is `grid_size × grid_size`.
    pub grid_size: usize,
    /// Frames discarded after the camera starts (auto-exposure settling).
    pub warmup_frames: usize,
    /// Face-mesh presence score below which a frame counts as "no face".
    pub min_presence: f32,
}

/// Optional overrides as they appear in `gazed.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    calibration_path: Option<PathBuf>,
    ridge_alpha: Option<f64>,
    screen_width: Option<u32>,
    screen_height: Option<u32>,
    frames_per_target: Option<usize>,
    grid_size: Option<usize>,
    warmup_frames: Option<usize>,
    min_presence: Option<f32>,
}

impl Config {
    /// Load from the process environment and the config file it points at.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an injectable environment.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&env);

        let path = config_path(&env);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let file: FileConfig = toml::from_str(&text).map_err(|source| {
                    ConfigError::Parse {
                        path: path.clone(),
                        source,
                    }
                })?;
                config.apply_file(file);
                tracing::info!(path = %path.display(), "loaded config file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn defaults(env: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home(env).join(".local/share"))
            .join("gaze");
        let model_dir = env("GAZE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(gaze_core::default_model_dir);

        Self {
            camera_device: DEFAULT_CAMERA_DEVICE.to_string(),
            model_dir,
            calibration_path: data_dir.join("calibration.json"),
            ridge_alpha: gaze_core::calibration::DEFAULT_RIDGE_ALPHA,
            screen_width: DEFAULT_SCREEN_WIDTH,
            screen_height: DEFAULT_SCREEN_HEIGHT,
            frames_per_target: DEFAULT_FRAMES_PER_TARGET,
            grid_size: DEFAULT_GRID_SIZE,
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            min_presence: gaze_core::detector::DEFAULT_MIN_PRESENCE,
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            camera_device,
            model_dir,
            calibration_path,
            ridge_alpha,
            screen_width,
            screen_height,
            frames_per_target,
            grid_size,
            warmup_frames,
            min_presence,
        } = file;
        set(&mut self.camera_device, camera_device);
        set(&mut self.model_dir, model_dir);
        set(&mut self.calibration_path, calibration_path);
        set(&mut self.ridge_alpha, ridge_alpha);
        set(&mut self.screen_width, screen_width);
        set(&mut self.screen_height, screen_height);
        set(&mut self.frames_per_target, frames_per_target);
        set(&mut self.grid_size, grid_size);
        set(&mut self.warmup_frames, warmup_frames);
        set(&mut self.min_presence, min_presence);
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        set(&mut self.camera_device, env("GAZE_CAMERA_DEVICE"));
        set(&mut self.model_dir, env("GAZE_MODEL_DIR").map(PathBuf::from));
        set(
            &mut self.calibration_path,
            env("GAZE_CALIBRATION_PATH").map(PathBuf::from),
        );
        set(&mut self.ridge_alpha, env_parse(env, "GAZE_RIDGE_ALPHA"));
        set(&mut self.screen_width, env_parse(env, "GAZE_SCREEN_WIDTH"));
        set(&mut self.screen_height, env_parse(env, "GAZE_SCREEN_HEIGHT"));
        set(&mut self.frames_per_target, env_parse(env, "GAZE_FRAMES_PER_TARGET"));
        set(&mut self.grid_size, env_parse(env, "GAZE_GRID_SIZE"));
        set(&mut self.warmup_frames, env_parse(env, "GAZE_WARMUP_FRAMES"));
        set(&mut self.min_presence, env_parse(env, "GAZE_MIN_PRESENCE"));
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| ConfigError::Invalid {
            key,
            reason: reason.to_string(),
        };
        if !(self.ridge_alpha.is_finite() && self.ridge_alpha >= 0.0) {
            return Err(invalid("ridge_alpha", "must be finite and >= 0"));
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(invalid("screen_width/screen_height", "must be non-zero"));
        }
        if self.frames_per_target == 0 {
            return Err(invalid("frames_per_target", "must be at least 1"));
        }
        if self.grid_size == 0 {
            return Err(invalid("grid_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_presence) {
            return Err(invalid("min_presence", "must be within [0, 1]"));
        }
        Ok(())
    }

    /// Path to the face-mesh landmark model.
    pub fn facemesh_model_path(&self) -> String {
        self.model_dir
            .join(gaze_core::detector::FACEMESH_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn screen(&self) -> gaze_core::ScreenSize {
        gaze_core::ScreenSize {
            width: self.screen_width,
            height: self.screen_height,
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn config_path(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(explicit) = env("GAZE_CONFIG") {
        return PathBuf::from(explicit);
    }
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"))
        .join(Path::new("gaze/gazed.toml"))
}

/// Parse an environment override; unparsable values keep the current setting.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
