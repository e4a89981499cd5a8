//! The face descriptor capability consumed by the builder and the recognizer.

use crate::types::Descriptor;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detects faces in an image and encodes each as a [`Descriptor`].
///
/// Implementations return one descriptor per detected face, most confident
/// face first, and an empty vector when no face is found.
pub trait DescriptorExtractor: Send + Sync {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractorError>;
}
