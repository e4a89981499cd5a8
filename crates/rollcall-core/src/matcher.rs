//! Nearest-neighbour matching of frame descriptors against the gallery.

use crate::types::{Descriptor, Gallery, Identity};

/// Default Euclidean match threshold, in the embedding space's native units.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Result of matching one query descriptor against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance to the closest gallery entry, `None` for an empty gallery.
    pub distance: Option<f32>,
    /// Index of the closest entry in gallery order.
    pub entry_index: Option<usize>,
}

/// Strategy for comparing a query descriptor against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Descriptor, gallery: &Gallery, threshold: f32) -> MatchResult;

    /// Match every query, one identity per query, order preserved.
    fn match_all(&self, queries: &[Descriptor], gallery: &Gallery, threshold: f32) -> Vec<Identity> {
        queries
            .iter()
            .map(|query| self.compare(query, gallery, threshold).identity)
            .collect()
    }
}

/// Minimum Euclidean distance matcher.
///
/// A query matches when the closest entry lies strictly under the threshold.
/// Ties resolve to the first entry in gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Descriptor, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.entries.iter().enumerate() {
            let d = query.distance(&entry.descriptor);
            let closer = match best {
                None => true,
                Some((_, best_d)) => d < best_d,
            };
            if closer {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, d)) if d < threshold => MatchResult {
                identity: Identity::Known(gallery.entries[idx].label.clone()),
                distance: Some(d),
                entry_index: Some(idx),
            },
            Some((idx, d)) => MatchResult {
                identity: Identity::Unknown,
                distance: Some(d),
                entry_index: Some(idx),
            },
            None => MatchResult {
                identity: Identity::Unknown,
                distance: None,
                entry_index: None,
            },
        }
    }
}
