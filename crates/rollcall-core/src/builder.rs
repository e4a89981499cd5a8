//! Gallery construction from the labeled image corpus.

use crate::corpus::{Corpus, CorpusError};
use crate::extractor::DescriptorExtractor;
use crate::store::StoreError;
use crate::types::{Gallery, GalleryEntry};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("corpus: {0}")]
    Corpus(#[from] CorpusError),
    #[error("gallery could not be persisted: {0}")]
    Persist(#[from] StoreError),
}

/// Per-build tallies, logged once the walk is done.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub images: usize,
    pub encoded: usize,
    pub undecodable: usize,
    pub no_face: usize,
    pub extractor_failed: usize,
    /// Descriptors with non-finite values or a length unlike the first one.
    pub rejected: usize,
}

pub struct GalleryBuilder {
    extractor: Arc<dyn DescriptorExtractor>,
}

impl GalleryBuilder {
    pub fn new(extractor: Arc<dyn DescriptorExtractor>) -> Self {
        Self { extractor }
    }

    /// Encode every corpus image into a fresh gallery.
    ///
    /// Only the first (most confident) face of each image is enrolled. Images
    /// that fail to decode, fail inference or contain no face are skipped
    /// with a warning; only an unreadable corpus aborts the build.
    ///
    /// Every entry has the length of the first encoded descriptor and only
    /// finite values, so the result always passes store validation.
    pub fn build(&self, corpus: &Corpus) -> Result<Gallery, BuildError> {
        let (gallery, _) = self.build_with_stats(corpus)?;
        Ok(gallery)
    }

    pub fn build_with_stats(&self, corpus: &Corpus) -> Result<(Gallery, BuildStats), BuildError> {
        let fingerprint = corpus.fingerprint()?;
        let images = corpus.images()?;

        let mut stats = BuildStats { images: images.len(), ..Default::default() };
        let mut entries: Vec<GalleryEntry> = Vec::with_capacity(images.len());

        for image in images {
            let decoded = match image::open(&image.path) {
                Ok(img) => img.into_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %image.path.display(), error = %e, "cannot read image; skipping");
                    stats.undecodable += 1;
                    continue;
                }
            };

            let descriptors = match self.extractor.detect_and_encode(&decoded) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(path = %image.path.display(), error = %e, "descriptor extraction failed; skipping");
                    stats.extractor_failed += 1;
                    continue;
                }
            };

            let Some(descriptor) = descriptors.into_iter().next() else {
                tracing::warn!(path = %image.path.display(), "no face found in image; skipping");
                stats.no_face += 1;
                continue;
            };

            let expected = entries.first().map(|e| e.descriptor.len());
            if descriptor.is_empty() || !descriptor.is_finite() || expected.is_some_and(|n| n != descriptor.len()) {
                tracing::warn!(
                    path = %image.path.display(),
                    dim = descriptor.len(),
                    expected = expected.unwrap_or(0),
                    "descriptor unusable; skipping"
                );
                stats.rejected += 1;
                continue;
            }

            entries.push(GalleryEntry { label: image.label, descriptor });
            stats.encoded += 1;
        }

        tracing::info!(
            images = stats.images,
            encoded = stats.encoded,
            undecodable = stats.undecodable,
            no_face = stats.no_face,
            extractor_failed = stats.extractor_failed,
            rejected = stats.rejected,
            "gallery built"
        );

        Ok((Gallery::new(entries, Some(fingerprint)), stats))
    }
}
