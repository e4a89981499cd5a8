//! JSON persistence for the gallery blob.

use crate::types::{Gallery, GALLERY_FORMAT_VERSION};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("gallery not found at {0}")]
    NotFound(PathBuf),
    #[error("gallery at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("gallery i/o: {0}")]
    Io(#[from] io::Error),
}

/// Durable home of the gallery blob.
///
/// `save` must refuse a gallery that `load` would later reject.
pub trait GalleryPersistence: Send + Sync {
    fn load(&self) -> Result<Gallery, StoreError>;

    fn save(&self, gallery: &Gallery) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// File-backed gallery store.
///
/// Saves go to a sibling temp file that is synced and renamed over the
/// target, so readers only ever see a complete blob.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    path: PathBuf,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(&self, gallery: &Gallery) -> Result<(), StoreError> {
        if gallery.format_version != GALLERY_FORMAT_VERSION {
            return Err(self.corrupt(format!(
                "unsupported format version {} (expected {GALLERY_FORMAT_VERSION})",
                gallery.format_version
            )));
        }
        let dim = gallery.entries.first().map(|e| e.descriptor.len());
        for (i, entry) in gallery.entries.iter().enumerate() {
            if entry.label.is_empty() {
                return Err(self.corrupt(format!("entry {i} has an empty label")));
            }
            if entry.descriptor.is_empty() || Some(entry.descriptor.len()) != dim {
                return Err(self.corrupt(format!(
                    "entry {i} has a {}-dim descriptor, expected {}",
                    entry.descriptor.len(),
                    dim.unwrap_or(0)
                )));
            }
            if !entry.descriptor.is_finite() {
                return Err(self.corrupt(format!("entry {i} has a non-finite descriptor value")));
            }
        }
        Ok(())
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::Corrupt { path: self.path.clone(), reason }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl GalleryPersistence for GalleryStore {
    fn load(&self) -> Result<Gallery, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        let gallery: Gallery = serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        self.validate(&gallery)?;

        tracing::debug!(path = %self.path.display(), entries = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        self.validate(gallery)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let result = write_synced(&tmp, gallery).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Io(e));
        }

        tracing::info!(path = %self.path.display(), entries = gallery.len(), "gallery saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn write_synced(path: &Path, gallery: &Gallery) -> io::Result<()> {
    let json = serde_json::to_vec(gallery).map_err(io::Error::other)?;
    let mut file = File::create(path)?;
    file.write_all(&json)?;
    file.sync_all()
}
