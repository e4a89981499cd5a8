use anyhow::{Context, Result};
use rollcall_core::capture::FrameSource;
use rollcall_core::recognizer::RecognizerConfig;
use rollcall_core::{Attendance, AttendanceConfig, OnnxExtractor};
use rollcall_hw::{ReplaySource, V4lSource};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::RollcallService;

const BUS_NAME: &str = "org.rollcall.Rollcall1";
const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

fn frame_source(config: &Config) -> Box<dyn FrameSource> {
    match &config.replay_dir {
        Some(dir) => Box::new(
            ReplaySource::new(dir)
                .looping(config.replay_loop)
                .interval(Duration::from_millis(config.replay_interval_ms)),
        ),
        None => Box::new(V4lSource::new(
            config.camera_device.clone(),
            config.capture_width,
            config.capture_height,
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        corpus = %config.corpus_dir.display(),
        gallery = %config.gallery_path.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let extractor = OnnxExtractor::load(&config.model_dir)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;

    let attendance = Arc::new(
        Attendance::new(
            AttendanceConfig {
                corpus_dir: config.corpus_dir.clone(),
                gallery_path: config.gallery_path.clone(),
                recognizer: RecognizerConfig {
                    threshold: config.match_threshold,
                    downscale: config.downscale,
                },
                jpeg_quality: config.jpeg_quality,
            },
            Arc::new(extractor),
            frame_source(&config),
        )
        .context("preparing corpus directory")?,
    );

    // A missing or stale gallery is rebuilt before clients arrive.
    let warmup = attendance.clone();
    match tokio::task::spawn_blocking(move || warmup.ensure_gallery()).await? {
        Ok(summary) => tracing::info!(entries = summary.entries, labels = summary.labels.len(), "gallery ready"),
        Err(e) => tracing::warn!(error = %e, "gallery unavailable; recognition will retry on first use"),
    }

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(attendance.clone()))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let stopper = attendance.clone();
    tokio::task::spawn_blocking(move || stopper.stop_capture()).await?;

    Ok(())
}
