use crate::config::Config;
use crate::schedule::{CalibrationSchedule, Step};
use gaze_core::calibration::CalibrationError;
use gaze_core::types::FeatureError;
use gaze_core::{
    decode_frame, CalibrationModel, ExtractError, FeatureNormalizer, FeatureVector, GazeExtractor,
    GazePoint, LandmarkDetector, ScreenSize,
};
use gaze_hw::{Camera, CameraError, Frame, LatestSlot};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

// --- Named constants (no magic numbers) ---
/// Longest the engine waits for a camera frame before re-checking requests.
const FRAME_WAIT: Duration = Duration::from_millis(50);
const REQUEST_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("{0}")]
    Extract(#[from] ExtractError),
    #[error("invalid features: {0}")]
    Features(#[from] FeatureError),
    #[error("calibration: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("a session is already running")]
    SessionActive,
    #[error("no fitted calibration to save")]
    NotFitted,
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Normalised and pixel gaze position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GazeReply {
    pub x: f64,
    pub y: f64,
    pub x_norm: f64,
    pub y_norm: f64,
}

impl GazeReply {
    fn new(point: GazePoint, screen: ScreenSize) -> Self {
        let (x, y) = point.to_pixels(screen);
        Self {
            x,
            y,
            x_norm: point.x_norm,
            y_norm: point.y_norm,
        }
    }
}

/// One processed camera frame, published to `CurrentGaze` readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GazeEstimate {
    pub x: f64,
    pub y: f64,
    pub x_norm: f64,
    pub y_norm: f64,
    /// Calibration target shown for this frame, if calibrating.
    pub target: Option<(f64, f64)>,
    pub detected: bool,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeaturesReply {
    pub features: Vec<f64>,
    pub dim: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitReply {
    pub fitted: bool,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub mode: &'static str,
    pub target_index: Option<usize>,
    pub targets: usize,
    pub processed: u64,
    pub detected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub calibration: &'static str,
    pub fitted: bool,
    pub samples: usize,
    pub feature_dim: Option<usize>,
    pub alpha: f64,
    pub reference_captured: bool,
    pub session: Option<SessionStatus>,
    pub camera_device: String,
    pub calibration_path: String,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartSession {
        reply: oneshot::Sender<Result<SessionStatus, EngineError>>,
    },
    StopSession {
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Predict {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<GazeReply, EngineError>>,
    },
    PredictFeatures {
        features: Vec<f64>,
        reply: oneshot::Sender<Result<GazeReply, EngineError>>,
    },
    ExtractFeatures {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<FeaturesReply, EngineError>>,
    },
    AddSample {
        features: Vec<f64>,
        x: f64,
        y: f64,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Fit {
        reply: oneshot::Sender<Result<FitReply, EngineError>>,
    },
    ResetReference {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Save {
        path: Option<PathBuf>,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
    Load {
        path: Option<PathBuf>,
        reply: oneshot::Sender<Result<FitReply, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    estimates: LatestSlot<GazeEstimate>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Open the camera and begin calibrating (or tracking, if the saved
    /// calibration loads and is fitted).
    pub async fn start_session(&self) -> Result<SessionStatus, EngineError> {
        self.request(|reply| EngineRequest::StartSession { reply }).await
    }

    /// Stop the session. `false` if none was running.
    pub async fn stop_session(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::StopSession { reply }).await
    }

    /// Newest unread estimate from the running session, if any.
    pub fn current_gaze(&self) -> Option<GazeEstimate> {
        self.estimates.try_take()
    }

    pub async fn predict(&self, image: Vec<u8>) -> Result<GazeReply, EngineError> {
        self.request(|reply| EngineRequest::Predict { image, reply }).await
    }

    pub async fn predict_features(&self, features: Vec<f64>) -> Result<GazeReply, EngineError> {
        self.request(|reply| EngineRequest::PredictFeatures { features, reply })
            .await
    }

    pub async fn extract_features(&self, image: Vec<u8>) -> Result<FeaturesReply, EngineError> {
        self.request(|reply| EngineRequest::ExtractFeatures { image, reply })
            .await
    }

    /// Returns the sample count after adding.
    pub async fn add_sample(&self, features: Vec<f64>, x: f64, y: f64) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::AddSample {
            features,
            x,
            y,
            reply,
        })
        .await
    }

    pub async fn fit(&self) -> Result<FitReply, EngineError> {
        self.request(|reply| EngineRequest::Fit { reply }).await
    }

    pub async fn reset_reference(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::ResetReference { reply })
            .await
    }

    /// Save to `path`, or the configured calibration path.
    pub async fn save(&self, path: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        self.request(|reply| EngineRequest::Save { path, reply }).await
    }

    pub async fn load(&self, path: Option<PathBuf>) -> Result<FitReply, EngineError> {
        self.request(|reply| EngineRequest::Load { path, reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

enum Mode {
    Calibrating(CalibrationSchedule),
    Tracking,
}

struct Session {
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<Result<u64, CameraError>>>,
    frames: LatestSlot<Frame>,
    mode: Mode,
    warmup_left: usize,
    processed: u64,
    detected: u64,
}

impl Session {
    fn status(&self) -> SessionStatus {
        let (mode, target_index, targets) = match &self.mode {
            Mode::Calibrating(s) => ("calibrating", Some(s.index()), s.len()),
            Mode::Tracking => ("tracking", None, 0),
        };
        SessionStatus {
            mode,
            target_index,
            targets,
            processed: self.processed,
            detected: self.detected,
        }
    }
}

/// Everything the engine thread owns.
struct Engine<D> {
    config: Config,
    /// Camera-stream extractor; its reference belongs to the session.
    extractor: GazeExtractor<D>,
    /// Reference for one-off `Predict`/`ExtractFeatures` images.
    oneshot: FeatureNormalizer,
    model: CalibrationModel,
    session: Option<Session>,
    estimates: LatestSlot<GazeEstimate>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the saved calibration (if any) before the thread starts; a
/// detector is expected to be loaded already.
pub fn spawn_engine<D>(config: Config, detector: D) -> Result<EngineHandle, EngineError>
where
    D: LandmarkDetector + Send + 'static,
{
    let mut engine = Engine::new(config, detector);
    engine.model = engine.startup_model();
    let estimates = engine.estimates.clone();

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("gaze-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            loop {
                let request = if engine.session.is_some() {
                    match rx.try_recv() {
                        Ok(req) => Some(req),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => break,
                    }
                } else {
                    match rx.blocking_recv() {
                        Some(req) => Some(req),
                        None => break,
                    }
                };
                if let Some(req) = request {
                    engine.handle(req);
                }
                engine.process_next_frame();
            }
            engine.stop_session();
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Spawn("engine", e))?;

    Ok(EngineHandle { tx, estimates })
}

impl<D: LandmarkDetector> Engine<D> {
    fn new(config: Config, detector: D) -> Self {
        let mut engine = Self {
            config,
            extractor: GazeExtractor::new(detector),
            oneshot: FeatureNormalizer::new(),
            model: CalibrationModel::default(),
            session: None,
            estimates: LatestSlot::new(),
        };
        engine.model = engine.fresh_model();
        engine
    }

    fn fresh_model(&self) -> CalibrationModel {
        CalibrationModel::with_alpha(self.config.ridge_alpha).unwrap_or_default()
    }

    /// The saved calibration if it loads, otherwise an empty model.
    fn startup_model(&self) -> CalibrationModel {
        let path = &self.config.calibration_path;
        if !path.exists() {
            tracing::info!(path = %path.display(), "no saved calibration");
            return self.fresh_model();
        }
        match CalibrationModel::load(path) {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable calibration");
                self.fresh_model()
            }
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartSession { reply } => {
                let _ = reply.send(self.start_session());
            }
            EngineRequest::StopSession { reply } => {
                let _ = reply.send(Ok(self.stop_session()));
            }
            EngineRequest::Predict { image, reply } => {
                let _ = reply.send(self.predict(&image));
            }
            EngineRequest::PredictFeatures { features, reply } => {
                let _ = reply.send(self.predict_features(&features));
            }
            EngineRequest::ExtractFeatures { image, reply } => {
                let _ = reply.send(self.extract_features(&image));
            }
            EngineRequest::AddSample {
                features,
                x,
                y,
                reply,
            } => {
                let _ = reply.send(self.add_sample(&features, x, y));
            }
            EngineRequest::Fit { reply } => {
                let _ = reply.send(self.fit());
            }
            EngineRequest::ResetReference { reply } => {
                self.reset_reference();
                let _ = reply.send(Ok(()));
            }
            EngineRequest::Save { path, reply } => {
                let _ = reply.send(self.save(path));
            }
            EngineRequest::Load { path, reply } => {
                let _ = reply.send(self.load(path));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    fn start_session(&mut self) -> Result<SessionStatus, EngineError> {
        if self.session.is_some() {
            return Err(EngineError::SessionActive);
        }

        let camera = Camera::open(&self.config.camera_device)?;
        let frames = LatestSlot::new();
        let running = Arc::new(AtomicBool::new(true));
        let capture = {
            let frames = frames.clone();
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("gaze-capture".into())
                .spawn(move || {
                    let result = camera.run_capture(&frames, &running);
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "capture failed");
                    }
                    result
                })
                .map_err(|e| EngineError::Spawn("capture", e))?
        };

        Ok(self.begin_session(frames, running, Some(capture)))
    }

    /// Prepare the core for a session fed from `frames`.
    fn begin_session(
        &mut self,
        frames: LatestSlot<Frame>,
        running: Arc<AtomicBool>,
        capture: Option<JoinHandle<Result<u64, CameraError>>>,
    ) -> SessionStatus {
        self.extractor.reset_reference();
        self.extractor.detector_mut().reset_tracking();

        // Only a saved calibration skips the grid; anything else recalibrates.
        let path = &self.config.calibration_path;
        self.model = if path.exists() {
            match CalibrationModel::load(path) {
                Ok(model) => model,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "saved calibration unusable, recalibrating");
                    self.fresh_model()
                }
            }
        } else {
            self.fresh_model()
        };

        let mode = if self.model.is_fitted() {
            Mode::Tracking
        } else {
            Mode::Calibrating(CalibrationSchedule::new(
                self.config.grid_size,
                self.config.frames_per_target,
                &mut rand::thread_rng(),
            ))
        };

        let session = Session {
            running,
            capture,
            frames,
            mode,
            warmup_left: self.config.warmup_frames,
            processed: 0,
            detected: 0,
        };
        let status = session.status();
        tracing::info!(mode = status.mode, targets = status.targets, "session started");
        self.session = Some(session);
        status
    }

    fn stop_session(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.running.store(false, Ordering::Release);
        if let Some(handle) = session.capture.take() {
            match handle.join() {
                Ok(Ok(frames)) => tracing::debug!(frames, "capture thread joined"),
                Ok(Err(e)) => tracing::warn!(error = %e, "capture thread ended with error"),
                Err(_) => tracing::error!("capture thread panicked"),
            }
        }
        session.frames.drain();
        self.estimates.drain();
        tracing::info!(
            processed = session.processed,
            detected = session.detected,
            "session stopped"
        );
        true
    }

    fn process_next_frame(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.capture.as_ref().is_some_and(|h| h.is_finished()) {
            tracing::warn!("capture thread ended, stopping session");
            self.stop_session();
            return;
        }
        let Some(frame) = session.frames.take_timeout(FRAME_WAIT) else {
            return;
        };
        self.process_frame(&frame);
    }

    fn process_frame(&mut self, frame: &Frame) {
        let Self {
            config,
            extractor,
            model,
            session,
            estimates,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return;
        };
        if session.warmup_left > 0 {
            session.warmup_left -= 1;
            return;
        }
        session.processed += 1;

        let features = match extractor.extract(&frame.image) {
            Ok(features) => features,
            Err(e) => {
                tracing::debug!(seq = frame.sequence, error = %e, "feature extraction failed");
                None
            }
        };
        if features.is_some() {
            session.detected += 1;
        }

        let mut point = GazePoint::CENTER;
        let mut target = None;
        let mut finished = false;
        match &mut session.mode {
            Mode::Calibrating(schedule) => {
                target = schedule.current();
                if let (Some(f), Some((tx, ty))) = (&features, target) {
                    if let Err(e) = model.add(f, tx, ty) {
                        tracing::warn!(error = %e, "calibration sample rejected");
                    }
                }
                match schedule.advance() {
                    Step::Dwell => {}
                    Step::NextTarget => {
                        tracing::debug!(index = schedule.index(), target = ?schedule.current(), "next calibration target");
                    }
                    Step::Finished => finished = true,
                }
            }
            Mode::Tracking => {
                if let Some(f) = &features {
                    match model.predict(f) {
                        Ok(p) => point = p,
                        Err(e) => tracing::debug!(error = %e, "prediction failed"),
                    }
                }
            }
        }

        if finished {
            match model.fit() {
                Ok(true) => tracing::info!(samples = model.sample_count(), "calibration complete"),
                Ok(false) => tracing::warn!(
                    samples = model.sample_count(),
                    "calibration grid finished with too few samples; tracking reports the screen centre"
                ),
                Err(e) => tracing::warn!(error = %e, "calibration fit failed"),
            }
            session.mode = Mode::Tracking;
        }

        let reply = GazeReply::new(point, config.screen());
        estimates.put(GazeEstimate {
            x: reply.x,
            y: reply.y,
            x_norm: reply.x_norm,
            y_norm: reply.y_norm,
            target,
            detected: features.is_some(),
            sequence: frame.sequence,
        });
    }

    fn extract(&mut self, image: &[u8]) -> Result<FeatureVector, EngineError> {
        let frame = decode_frame(image)?;
        self.extractor
            .extract_detached(&mut self.oneshot, &frame)?
            .ok_or(EngineError::NoFaceDetected)
    }

    fn predict(&mut self, image: &[u8]) -> Result<GazeReply, EngineError> {
        let features = self.extract(image)?;
        let point = self.model.predict(&features)?;
        Ok(GazeReply::new(point, self.config.screen()))
    }

    fn predict_features(&self, flat: &[f64]) -> Result<GazeReply, EngineError> {
        let features = FeatureVector::from_flat(flat)?;
        let point = self.model.predict(&features)?;
        Ok(GazeReply::new(point, self.config.screen()))
    }

    fn extract_features(&mut self, image: &[u8]) -> Result<FeaturesReply, EngineError> {
        let features = self.extract(image)?.flatten();
        Ok(FeaturesReply {
            dim: features.len(),
            features,
        })
    }

    fn add_sample(&mut self, flat: &[f64], x: f64, y: f64) -> Result<usize, EngineError> {
        let features = FeatureVector::from_flat(flat)?;
        self.model.add(&features, x, y)?;
        Ok(self.model.sample_count())
    }

    fn fit(&mut self) -> Result<FitReply, EngineError> {
        let fitted = self.model.fit()?;
        Ok(FitReply {
            fitted,
            samples: self.model.sample_count(),
        })
    }

    fn reset_reference(&mut self) {
        self.extractor.reset_reference();
        self.oneshot.reset_reference();
        self.extractor.detector_mut().reset_tracking();
    }

    fn save(&self, path: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        if !self.model.is_fitted() {
            return Err(EngineError::NotFitted);
        }
        let path = path.unwrap_or_else(|| self.config.calibration_path.clone());
        self.model.save(&path)?;
        Ok(path)
    }

    fn load(&mut self, path: Option<PathBuf>) -> Result<FitReply, EngineError> {
        let path = path.unwrap_or_else(|| self.config.calibration_path.clone());
        self.model = CalibrationModel::load(&path)?;

        // A fitted calibration makes the rest of the grid pointless.
        if let Some(session) = self.session.as_mut() {
            if self.model.is_fitted() && matches!(session.mode, Mode::Calibrating(_)) {
                tracing::info!("fitted calibration loaded mid-session, switching to tracking");
                session.mode = Mode::Tracking;
            }
        }
        Ok(FitReply {
            fitted: self.model.is_fitted(),
            samples: self.model.sample_count(),
        })
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            calibration: match self.model.state() {
                gaze_core::CalibrationState::Empty => "empty",
                gaze_core::CalibrationState::Accumulating => "accumulating",
                gaze_core::CalibrationState::Fitted => "fitted",
            },
            fitted: self.model.is_fitted(),
            samples: self.model.sample_count(),
            feature_dim: self.model.feature_dim(),
            alpha: self.model.alpha(),
            reference_captured: self.extractor.reference().is_some(),
            session: self.session.as_ref().map(Session::status),
            camera_device: self.config.camera_device.clone(),
            calibration_path: self.config.calibration_path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaze_core::detector::DetectorError;
    use gaze_core::normalizer::{FACEMESH_LEFT_EYE, FACEMESH_RIGHT_EYE};
    use gaze_core::Landmarks;
    use image::RgbImage;
    use std::path::Path;

    /// Always sees the same face, eyes shifted by whatever `gaze` holds.
    struct FixedFace {
        gaze: Option<(f64, f64)>,
        resets: usize,
    }

    impl LandmarkDetector for FixedFace {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Option<Landmarks>, DetectorError> {
            let Some((gx, gy)) = self.gaze else {
                return Ok(None);
            };
            let mut points = vec![(200.0, 150.0); 478];
            points[0] = (100.0, 50.0);
            points[1] = (300.0, 250.0);
            for (k, &i) in FACEMESH_LEFT_EYE.iter().chain(FACEMESH_RIGHT_EYE.iter()).enumerate() {
                points[i] = (160.0 + k as f64 * 2.0 + gx, 135.0 + (k % 3) as f64 + gy);
            }
            Ok(Some(Landmarks::new(points)))
        }

        fn reset_tracking(&mut self) {
            self.resets += 1;
        }
    }

    fn config(dir: &Path) -> Config {
        Config {
            camera_device: "/dev/null-camera".into(),
            model_dir: dir.to_path_buf(),
            calibration_path: dir.join("calibration.json"),
            ridge_alpha: 0.5,
            screen_width: 1920,
            screen_height: 1080,
            frames_per_target: 2,
            grid_size: 2,
            warmup_frames: 1,
            min_presence: 0.5,
        }
    }

    fn engine(dir: &Path, gaze: Option<(f64, f64)>) -> Engine<FixedFace> {
        Engine::new(config(dir), FixedFace { gaze, resets: 0 })
    }

    fn png() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(RgbImage::new(16, 16))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn frame(sequence: u32) -> Frame {
        Frame {
            image: RgbImage::new(16, 16),
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    fn fitted(engine: &mut Engine<FixedFace>) {
        for (i, (x, y)) in [(0.2, 0.2), (0.8, 0.3), (0.4, 0.9), (0.6, 0.5)].into_iter().enumerate() {
            let flat: Vec<f64> = (0..68).map(|j| ((i * 13 + j * 7) % 17) as f64 / 17.0).collect();
            engine.add_sample(&flat, x, y).unwrap();
        }
        assert!(engine.fit().unwrap().fitted);
    }

    #[test]
    fn test_unfitted_predict_features_is_screen_centre() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        let reply = engine.predict_features(&[0.1; 68]).unwrap();
        assert_eq!(
            reply,
            GazeReply {
                x: 960.0,
                y: 540.0,
                x_norm: 0.5,
                y_norm: 0.5
            }
        );
    }

    #[test]
    fn test_odd_feature_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), None);
        assert!(matches!(
            engine.predict_features(&[0.1; 5]),
            Err(EngineError::Features(FeatureError::OddLength(5)))
        ));
    }

    #[test]
    fn test_predict_without_face() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        assert!(matches!(engine.predict(&png()), Err(EngineError::NoFaceDetected)));
        assert!(matches!(
            engine.predict(b"garbage"),
            Err(EngineError::Extract(ExtractError::Decode(_)))
        ));
    }

    #[test]
    fn test_extract_features_reports_dim() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some((0.0, 0.0)));
        let reply = engine.extract_features(&png()).unwrap();
        assert_eq!(reply.dim, 68);
        assert_eq!(reply.features.len(), 68);
        assert!(engine.oneshot.reference().is_some());
        assert!(!engine.status().reference_captured);
    }

    #[test]
    fn test_fit_reports_underfit_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        engine.add_sample(&[0.0; 68], 0.5, 0.5).unwrap();
        assert_eq!(
            engine.fit().unwrap(),
            FitReply {
                fitted: false,
                samples: 1
            }
        );
    }

    #[test]
    fn test_save_requires_fit_then_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        assert!(matches!(engine.save(None), Err(EngineError::NotFitted)));

        fitted(&mut engine);
        let path = engine.save(None).unwrap();
        assert_eq!(path, dir.path().join("calibration.json"));

        let probe = vec![0.3; 68];
        let before = engine.predict_features(&probe).unwrap();
        engine.model = CalibrationModel::new();
        let loaded = engine.load(None).unwrap();
        assert!(loaded.fitted);
        assert_eq!(engine.predict_features(&probe).unwrap(), before);
    }

    #[test]
    fn test_load_missing_file_keeps_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        fitted(&mut engine);
        let err = engine.load(Some(dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, EngineError::Calibration(CalibrationError::Persist(_))));
        assert!(engine.model.is_fitted());
    }

    #[test]
    fn test_session_calibrates_then_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some((0.0, 0.0)));
        let frames = LatestSlot::new();
        let status = engine.begin_session(frames.clone(), Arc::new(AtomicBool::new(true)), None);
        assert_eq!(status.mode, "calibrating");
        assert_eq!(status.targets, 4);
        assert_eq!(engine.extractor.detector_mut().resets, 1);

        // One warmup frame, then 4 targets × 2 frames.
        for seq in 0..9 {
            frames.put(frame(seq));
            engine.process_next_frame();
        }

        assert_eq!(engine.model.sample_count(), 8);
        assert!(engine.model.is_fitted());
        let session = engine.session.as_ref().unwrap().status();
        assert_eq!(session.mode, "tracking");
        assert_eq!((session.processed, session.detected), (8, 8));

        let last = engine.estimates.try_take().unwrap();
        assert_eq!(last.sequence, 8);
        assert!(last.detected);
        assert!(last.target.is_some());

        frames.put(frame(9));
        engine.process_next_frame();
        let tracked = engine.estimates.try_take().unwrap();
        assert_eq!(tracked.target, None);
        assert!((0.0..=1.0).contains(&tracked.x_norm));

        assert!(engine.stop_session());
        assert!(!engine.stop_session());
        assert!(engine.estimates.try_take().is_none());
    }

    #[test]
    fn test_session_without_face_still_finishes_grid() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        let frames = LatestSlot::new();
        engine.begin_session(frames.clone(), Arc::new(AtomicBool::new(true)), None);
        for seq in 0..9 {
            frames.put(frame(seq));
            engine.process_next_frame();
        }
        assert!(!engine.model.is_fitted());
        assert_eq!(engine.session.as_ref().unwrap().status().mode, "tracking");

        let estimate = engine.estimates.try_take().unwrap();
        assert_eq!((estimate.x, estimate.y), (960.0, 540.0));
        assert!(!estimate.detected);
    }

    #[test]
    fn test_session_with_saved_calibration_tracks_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some((0.0, 0.0)));
        fitted(&mut engine);
        engine.save(None).unwrap();
        engine.model = CalibrationModel::new();

        let status = engine.begin_session(LatestSlot::new(), Arc::new(AtomicBool::new(true)), None);
        assert_eq!(status.mode, "tracking");
        assert!(engine.model.is_fitted());
        assert_eq!(engine.model.sample_count(), 0);
    }

    #[test]
    fn test_session_without_saved_file_recalibrates() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some((0.0, 0.0)));
        fitted(&mut engine);
        let status = engine.begin_session(LatestSlot::new(), Arc::new(AtomicBool::new(true)), None);
        assert_eq!(status.mode, "calibrating");
        assert!(!engine.model.is_fitted());
        assert_eq!(engine.model.sample_count(), 0);
    }

    #[test]
    fn test_loading_fitted_calibration_mid_grid_switches_to_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some((0.0, 0.0)));
        let frames = LatestSlot::new();
        engine.begin_session(frames.clone(), Arc::new(AtomicBool::new(true)), None);

        let saved = dir.path().join("other.json");
        fitted(&mut engine);
        engine.save(Some(saved.clone())).unwrap();
        engine.model = CalibrationModel::new();
        assert_eq!(engine.session.as_ref().unwrap().status().mode, "calibrating");

        assert!(engine.load(Some(saved)).unwrap().fitted);
        assert_eq!(engine.session.as_ref().unwrap().status().mode, "tracking");

        for seq in 0..2 {
            frames.put(frame(seq));
            engine.process_next_frame();
        }
        let estimate = engine.estimates.try_take().unwrap();
        assert_eq!(estimate.target, None);
        assert_eq!(engine.model.sample_count(), 0);
    }

    #[test]
    fn test_one_off_predict_does_not_touch_session_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), Some((0.0, 0.0)));
        let frames = LatestSlot::new();
        engine.begin_session(frames.clone(), Arc::new(AtomicBool::new(true)), None);
        let resets = engine.extractor.detector_mut().resets;

        engine.predict(&png()).unwrap();
        assert!(engine.extractor.reference().is_none());
        assert!(engine.oneshot.reference().is_some());
        assert_eq!(engine.extractor.detector_mut().resets, resets + 1);

        for seq in 0..2 {
            frames.put(frame(seq));
            engine.process_next_frame();
        }
        assert!(engine.extractor.reference().is_some());

        engine.reset_reference();
        assert!(engine.extractor.reference().is_none());
        assert!(engine.oneshot.reference().is_none());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        engine.begin_session(LatestSlot::new(), Arc::new(AtomicBool::new(true)), None);
        assert!(matches!(engine.start_session(), Err(EngineError::SessionActive)));
    }

    #[test]
    fn test_startup_ignores_corrupt_calibration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calibration.json"), "{").unwrap();
        let engine = engine(dir.path(), None);
        let model = engine.startup_model();
        assert!(!model.is_fitted());
        assert_eq!(model.alpha(), 0.5);
    }
}
