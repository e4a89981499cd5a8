use anyhow::{Context, Result};
use rollcall_core::capture::DEFAULT_JPEG_QUALITY;
use rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::recognizer::DEFAULT_DOWNSCALE;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Daemon configuration.
///
/// Defaults, overridden by an optional TOML file named by `ROLLCALL_CONFIG`,
/// overridden by `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the corpus and gallery when they are not set explicitly.
    pub data_dir: PathBuf,
    /// Labelled image corpus, one subdirectory per label.
    pub corpus_dir: PathBuf,
    /// Persisted gallery blob.
    pub gallery_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Replay this directory of images instead of opening the camera.
    pub replay_dir: Option<PathBuf>,
    pub replay_loop: bool,
    /// Milliseconds between replayed frames.
    pub replay_interval_ms: u64,
    /// Euclidean distance below which a face matches a gallery entry.
    pub match_threshold: f32,
    /// Frames are shrunk by this factor per side before recognition.
    pub downscale: u32,
    pub jpeg_quality: u8,
}

/// The TOML file: every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub corpus_dir: Option<PathBuf>,
    pub gallery_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub camera_device: Option<String>,
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub replay_dir: Option<PathBuf>,
    pub replay_loop: Option<bool>,
    pub replay_interval_ms: Option<u64>,
    pub match_threshold: Option<f32>,
    pub downscale: Option<u32>,
    pub jpeg_quality: Option<u8>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

impl Config {
    /// Load configuration from the process environment (and the file it names).
    pub fn load() -> Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::load(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge file values with environment lookups; the environment wins.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| env(key).map(PathBuf::from);

        let data_dir = path("ROLLCALL_DATA_DIR")
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        Self {
            corpus_dir: path("ROLLCALL_CORPUS_DIR")
                .or(file.corpus_dir)
                .unwrap_or_else(|| data_dir.join("images")),
            gallery_path: path("ROLLCALL_GALLERY_PATH")
                .or(file.gallery_path)
                .unwrap_or_else(|| data_dir.join("gallery.json")),
            model_dir: path("ROLLCALL_MODEL_DIR")
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            capture_width: parsed(&env, "ROLLCALL_CAPTURE_WIDTH").or(file.capture_width).unwrap_or(640),
            capture_height: parsed(&env, "ROLLCALL_CAPTURE_HEIGHT").or(file.capture_height).unwrap_or(480),
            replay_dir: path("ROLLCALL_REPLAY_DIR").or(file.replay_dir),
            replay_loop: env("ROLLCALL_REPLAY_LOOP")
                .map(|v| v != "0")
                .or(file.replay_loop)
                .unwrap_or(false),
            replay_interval_ms: parsed(&env, "ROLLCALL_REPLAY_INTERVAL_MS")
                .or(file.replay_interval_ms)
                .unwrap_or(33),
            match_threshold: parsed(&env, "ROLLCALL_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            downscale: parsed(&env, "ROLLCALL_DOWNSCALE")
                .or(file.downscale)
                .unwrap_or(DEFAULT_DOWNSCALE),
            jpeg_quality: parsed(&env, "ROLLCALL_JPEG_QUALITY")
                .or(file.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY)
                .clamp(1, 100),
            data_dir,
        }
    }
}

fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
