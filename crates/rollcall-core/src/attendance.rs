//! The service object handed to outer surfaces (D-Bus, CLI, tests).

use crate::builder::{BuildError, GalleryBuilder};
use crate::capture::{CaptureController, CaptureError, CaptureStatsSnapshot, FrameBuffer, FrameSource};
use crate::corpus::{Corpus, CorpusError};
use crate::extractor::DescriptorExtractor;
use crate::gallery::{GalleryError, GalleryService, UpdateError};
use crate::recognizer::{FrameRecognizer, RecognizerConfig};
use crate::session::AttendanceSession;
use crate::store::GalleryStore;
use crate::types::{AttendanceRecord, GallerySummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AttendanceConfig {
    pub corpus_dir: PathBuf,
    pub gallery_path: PathBuf,
    pub recognizer: RecognizerConfig,
    pub jpeg_quality: u8,
}

/// Point-in-time view of the service, for status replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceStatusReport {
    pub capturing: bool,
    pub source: String,
    pub present: usize,
    pub stats: CaptureStatsSnapshot,
    pub gallery: Option<GallerySummary>,
    pub threshold: f32,
}

/// Gallery maintenance plus the capture session, behind one owned object.
pub struct Attendance {
    gallery: Arc<GalleryService>,
    session: Arc<AttendanceSession>,
    frames: Arc<FrameBuffer>,
    capture: CaptureController,
    threshold: f32,
}

impl Attendance {
    /// Wire the service together. Creates the corpus directory if needed.
    pub fn new(
        config: AttendanceConfig,
        extractor: Arc<dyn DescriptorExtractor>,
        source: Box<dyn FrameSource>,
    ) -> Result<Self, CorpusError> {
        let corpus = Corpus::new(config.corpus_dir);
        corpus.ensure_exists()?;

        let gallery = Arc::new(GalleryService::new(
            corpus,
            GalleryStore::new(config.gallery_path),
            GalleryBuilder::new(extractor.clone()),
        ));
        let session = Arc::new(AttendanceSession::new());
        let frames = Arc::new(FrameBuffer::new());
        let recognizer = FrameRecognizer::new(gallery.clone(), extractor, config.recognizer);
        let capture = CaptureController::new(
            source,
            recognizer,
            session.clone(),
            frames.clone(),
            config.jpeg_quality,
        );

        Ok(Self {
            gallery,
            session,
            frames,
            capture,
            threshold: config.recognizer.threshold,
        })
    }

    /// Load the gallery, building it if it is missing, corrupt or stale.
    pub fn ensure_gallery(&self) -> Result<GallerySummary, GalleryError> {
        Ok(self.gallery.current()?.summary())
    }

    pub fn rebuild_gallery(&self) -> Result<GallerySummary, BuildError> {
        Ok(self.gallery.rebuild()?.summary())
    }

    pub fn enroll_image(&self, label: &str, image_bytes: &[u8]) -> Result<GallerySummary, UpdateError> {
        Ok(self.gallery.enroll_image(label, image_bytes)?.summary())
    }

    pub fn remove_label(&self, label: &str) -> Result<GallerySummary, UpdateError> {
        Ok(self.gallery.remove_label(label)?.summary())
    }

    /// Image count per enrolled label, straight from the corpus.
    pub fn list_labels(&self) -> Result<BTreeMap<String, usize>, CorpusError> {
        self.gallery.labels()
    }

    pub fn start_capture(&self) -> Result<bool, CaptureError> {
        self.capture.start()
    }

    pub fn stop_capture(&self) -> bool {
        self.capture.stop()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn current_frame(&self) -> Option<Arc<[u8]>> {
        self.frames.latest()
    }

    pub fn attendance_snapshot(&self) -> Vec<AttendanceRecord> {
        self.session.snapshot()
    }

    pub fn attendance_delta(&self) -> Vec<String> {
        self.session.recent_delta()
    }

    pub fn status(&self) -> AttendanceStatusReport {
        AttendanceStatusReport {
            capturing: self.capture.is_running(),
            source: self.capture.source_description(),
            present: self.session.len(),
            stats: self.capture.stats(),
            gallery: self.gallery.cached_summary(),
            threshold: self.threshold,
        }
    }
}
