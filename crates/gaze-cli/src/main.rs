use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

// --- Named constants (no magic numbers) ---
const METHOD_TIMEOUT: Duration = Duration::from_secs(10);
const WATCH_INTERVAL: Duration = Duration::from_millis(33);

#[zbus::proxy(
    interface = "org.freedesktop.Gaze1",
    default_service = "org.freedesktop.Gaze1",
    default_path = "/org/freedesktop/Gaze1"
)]
trait Gaze {
    async fn start_session(&self) -> zbus::Result<String>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn current_gaze(&self) -> zbus::Result<String>;
    async fn predict(&self, image: &[u8]) -> zbus::Result<String>;
    async fn extract_features(&self, image: &[u8]) -> zbus::Result<String>;
    async fn fit(&self) -> zbus::Result<String>;
    async fn reset_reference(&self) -> zbus::Result<()>;
    async fn save(&self, path: &str) -> zbus::Result<String>;
    async fn load(&self, path: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser, Debug)]
#[command(name = "gaze", about = "Webcam gaze tracking CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Show daemon status
    Status,
    /// Start a camera session (calibrates first unless a saved calibration loads)
    Start,
    /// Stop the camera session
    Stop,
    /// Print the latest gaze estimate
    Gaze {
        /// Keep printing estimates until interrupted
        #[arg(short, long)]
        watch: bool,
    },
    /// Predict gaze for an image file
    Predict { image: PathBuf },
    /// Extract the feature vector for an image file (via the daemon)
    Features { image: PathBuf },
    /// Refit the calibration on all accumulated samples
    Fit,
    /// Forget the reference head pose
    Reset,
    /// Save the fitted calibration (default: the daemon's configured path)
    Save { path: Option<PathBuf> },
    /// Load a saved calibration
    Load { path: PathBuf },
    /// Extract features locally, without the daemon
    Extract {
        image: PathBuf,
        /// Directory containing face_landmark.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Show the header of a calibration file
    Inspect { file: PathBuf },
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract { image, model_dir } => extract_offline(&image, model_dir),
        Commands::Inspect { file } => {
            let info = gaze_core::inspect(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Devices => {
            let devices = gaze_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        command => run_remote(command).await,
    }
}

async fn connect() -> Result<GazeProxy<'static>> {
    let conn = zbus::connection::Builder::session()?
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("connecting to the session bus")?;
    tracing::debug!(unique_name = ?conn.unique_name(), "connected to session bus");
    GazeProxy::new(&conn)
        .await
        .context("gazed is not reachable on the session bus")
}

async fn run_remote(command: Commands) -> Result<()> {
    let proxy = connect().await?;

    match command {
        Commands::Status => print_json(&proxy.status().await?),
        Commands::Start => print_json(&proxy.start_session().await?),
        Commands::Stop => {
            if proxy.stop_session().await? {
                println!("Session stopped");
            } else {
                println!("No session was running");
            }
        }
        Commands::Gaze { watch: false } => print_json(&proxy.current_gaze().await?),
        Commands::Gaze { watch: true } => loop {
            let reply = proxy.current_gaze().await?;
            if reply != "null" {
                println!("{reply}");
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            }
        },
        Commands::Predict { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.predict(&bytes).await?);
        }
        Commands::Features { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.extract_features(&bytes).await?);
        }
        Commands::Fit => print_json(&proxy.fit().await?),
        Commands::Reset => {
            proxy.reset_reference().await?;
            println!("Reference pose cleared");
        }
        Commands::Save { path } => {
            let arg = match path {
                Some(p) => absolute(&p)?.display().to_string(),
                None => String::new(),
            };
            tracing::debug!(path = %arg, "requesting save");
            let written = proxy.save(&arg).await?;
            println!("Calibration saved to {written}");
        }
        Commands::Load { path } => {
            let path = absolute(&path)?;
            print_json(&proxy.load(&path.display().to_string()).await?);
        }
        local => anyhow::bail!("{local:?} does not talk to the daemon"),
    }

    Ok(())
}

/// The daemon resolves paths against its own working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply; anything unparsable is printed verbatim.
fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

fn extract_offline(image: &Path, model_dir: Option<PathBuf>) -> Result<()> {
    let model_dir = model_dir.unwrap_or_else(gaze_core::default_model_dir);
    let model_path = model_dir.join(gaze_core::detector::FACEMESH_MODEL_FILE);
    tracing::debug!(model = %model_path.display(), image = %image.display(), "extracting offline");
    let detector = gaze_core::FaceMeshDetector::load(
        &model_path.to_string_lossy(),
        gaze_core::detector::DEFAULT_MIN_PRESENCE,
    )?;
    let mut extractor = gaze_core::GazeExtractor::new(detector);

    let bytes = read_image(image)?;
    match extractor.extract_bytes(&bytes)? {
        Some(features) => {
            let flat = features.flatten();
            let reply = serde_json::json!({ "features": flat, "dim": flat.len() });
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        None => anyhow::bail!("no face detected in {}", image.display()),
    }
    Ok(())
}
