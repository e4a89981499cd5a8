use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk gallery layout. Bumped whenever the blob shape changes.
pub const GALLERY_FORMAT_VERSION: u32 = 1;

/// Fixed-length face descriptor in the extractor's embedding space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance to `other`.
    ///
    /// Descriptors of different lengths, or containing NaN, are incomparable
    /// and report `f32::INFINITY`, so they can never fall under a match
    /// threshold.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        let d = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt();
        if d.is_nan() {
            f32::INFINITY
        } else {
            d
        }
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One enrolled face: the label it belongs to and its descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub descriptor: Descriptor,
}

/// The full set of enrolled faces, rebuilt wholesale from the image corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    pub format_version: u32,
    /// SHA-256 over the corpus listing this gallery was built from.
    pub fingerprint: Option<String>,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<GalleryEntry>,
}

impl Default for Gallery {
    fn default() -> Self {
        Self {
            format_version: GALLERY_FORMAT_VERSION,
            fingerprint: None,
            built_at: Utc::now(),
            entries: Vec::new(),
        }
    }
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>, fingerprint: Option<String>) -> Self {
        Self {
            format_version: GALLERY_FORMAT_VERSION,
            fingerprint,
            built_at: Utc::now(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries per label, in label order.
    pub fn label_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.label.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn entries_for<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a GalleryEntry> + 'a {
        self.entries.iter().filter(move |e| e.label == label)
    }

    pub fn summary(&self) -> GallerySummary {
        GallerySummary {
            entries: self.entries.len(),
            labels: self.label_counts(),
            built_at: self.built_at,
        }
    }
}

/// Lightweight description of a gallery, suitable for status replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GallerySummary {
    pub entries: usize,
    pub labels: BTreeMap<String, usize>,
    pub built_at: DateTime<Utc>,
}

/// Outcome of matching one frame descriptor against the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn label(&self) -> Option<&str> {
        match self {
            Identity::Known(label) => Some(label),
            Identity::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Known(label) => f.write_str(label),
            Identity::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttendanceStatus::Present => f.write_str("Present"),
        }
    }
}

/// First sighting of a label during a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub label: String,
    pub marked_at: DateTime<Local>,
    pub status: AttendanceStatus,
}
