//! Replays a directory of still images as a frame stream.

use image::RgbImage;
use rollcall_core::capture::{FrameSource, FrameStream, ReadOutcome, SourceError};
use std::path::{Path, PathBuf};
use std::time::Duration;

const REPLAY_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Frames are the directory's images in file-name order.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    dir: PathBuf,
    looping: bool,
    interval: Duration,
}

impl ReplaySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            looping: false,
            interval: Duration::ZERO,
        }
    }

    /// Start over after the last image instead of ending the stream.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Pause between frames, to mimic a camera's frame rate.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn frame_paths(&self) -> Result<Vec<PathBuf>, SourceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SourceError::DeviceNotFound(self.dir.display().to_string()),
            _ => SourceError::Open(format!("{}: {e}", self.dir.display())),
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| REPLAY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ReplaySource {
    fn open(&self) -> Result<Box<dyn FrameStream>, SourceError> {
        let paths = self.frame_paths()?;
        if paths.is_empty() {
            return Err(SourceError::Open(format!("no images in {}", self.dir.display())));
        }
        tracing::info!(dir = %self.dir.display(), frames = paths.len(), looping = self.looping, "replay opened");
        Ok(Box::new(ReplayStream {
            paths,
            next: 0,
            looping: self.looping,
            interval: self.interval,
        }))
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.dir.display())
    }
}

struct ReplayStream {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
    interval: Duration,
}

impl ReplayStream {
    fn load(path: &Path) -> Result<RgbImage, image::ImageError> {
        Ok(image::open(path)?.to_rgb8())
    }
}

impl FrameStream for ReplayStream {
    fn read(&mut self) -> ReadOutcome {
        if self.next >= self.paths.len() {
            if !self.looping {
                return ReadOutcome::EndOfStream;
            }
            self.next = 0;
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }

        let path = &self.paths[self.next];
        self.next += 1;
        match Self::load(path) {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(e) => ReadOutcome::Transient(format!("{}: {e}", path.display())),
        }
    }
}
