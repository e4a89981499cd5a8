//! Per-frame recognition: downsample, extract descriptors, match.

use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::gallery::{GalleryError, GalleryService};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::types::Identity;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

/// Linear downscale applied to frames before extraction (4 = quarter size per side).
pub const DEFAULT_DOWNSCALE: u32 = 4;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
}

#[derive(Debug, Clone, Copy)]
pub struct RecognizerConfig {
    pub threshold: f32,
    pub downscale: u32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            downscale: DEFAULT_DOWNSCALE,
        }
    }
}

pub struct FrameRecognizer {
    gallery: Arc<GalleryService>,
    extractor: Arc<dyn DescriptorExtractor>,
    matcher: EuclideanMatcher,
    config: RecognizerConfig,
}

impl FrameRecognizer {
    pub fn new(
        gallery: Arc<GalleryService>,
        extractor: Arc<dyn DescriptorExtractor>,
        config: RecognizerConfig,
    ) -> Self {
        Self {
            gallery,
            extractor,
            matcher: EuclideanMatcher,
            config,
        }
    }

    /// Identify every face in `frame`, one identity per detected face.
    ///
    /// With an empty gallery nothing can match, so extraction is skipped and
    /// no identities are reported.
    pub fn recognize(&self, frame: &RgbImage) -> Result<Vec<Identity>, RecognizeError> {
        let gallery = self.gallery.current()?;
        if gallery.is_empty() {
            return Ok(Vec::new());
        }

        let small = downsample(frame, self.config.downscale);
        let descriptors = self.extractor.detect_and_encode(&small)?;
        let identities = self.matcher.match_all(&descriptors, &gallery, self.config.threshold);

        tracing::trace!(
            faces = descriptors.len(),
            known = identities.iter().filter(|i| i.is_known()).count(),
            "frame recognized"
        );
        Ok(identities)
    }
}

/// Shrink `frame` by `factor` per side. Factors of 0 or 1 return a copy.
pub fn downsample(frame: &RgbImage, factor: u32) -> RgbImage {
    if factor <= 1 {
        return frame.clone();
    }
    let width = (frame.width() / factor).max(1);
    let height = (frame.height() / factor).max(1);
    imageops::resize(frame, width, height, FilterType::Triangle)
}
