//! The labeled image corpus: one subdirectory per label, image files inside.

use chrono::Local;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("corpus unreadable at {path}: {source}")]
    Unreadable { path: PathBuf, source: io::Error },
    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
    #[error("label not found: {0}")]
    LabelNotFound(String),
    #[error("image does not decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("corpus write failed: {0}")]
    Io(#[from] io::Error),
}

/// An image file belonging to a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusImage {
    pub label: String,
    pub path: PathBuf,
}

/// Check that `label` can name a corpus subdirectory.
///
/// Returns the trimmed label. Path separators and the `.`/`..` names are
/// rejected so a label can never escape the corpus root.
pub fn validate_label(label: &str) -> Result<&str, CorpusError> {
    let trimmed = label.trim();
    let bad = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(CorpusError::InvalidLabel(label.to_string()));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
}

impl Corpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_exists(&self) -> Result<(), CorpusError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Every image of every label, labels and files in sorted order.
    pub fn images(&self) -> Result<Vec<CorpusImage>, CorpusError> {
        let mut images = Vec::new();
        for label in self.label_dirs()? {
            let dir = self.root.join(&label);
            for path in sorted_files(&dir)? {
                images.push(CorpusImage { label: label.clone(), path });
            }
        }
        Ok(images)
    }

    /// Image count per label.
    pub fn labels(&self) -> Result<BTreeMap<String, usize>, CorpusError> {
        let mut labels = BTreeMap::new();
        for label in self.label_dirs()? {
            let count = sorted_files(&self.root.join(&label))?.len();
            labels.insert(label, count);
        }
        Ok(labels)
    }

    /// SHA-256 over the sorted `(label, file, size, mtime)` listing.
    ///
    /// Any add, delete or rewrite of a corpus image changes the fingerprint.
    pub fn fingerprint(&self) -> Result<String, CorpusError> {
        let mut hasher = Sha256::new();
        for image in self.images()? {
            let meta = fs::metadata(&image.path).map_err(|source| CorpusError::Unreadable {
                path: image.path.clone(),
                source,
            })?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            let name = image
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            hasher.update(image.label.as_bytes());
            hasher.update([0]);
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(meta.len().to_le_bytes());
            hasher.update(mtime.to_le_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Store `bytes` as a new image under `label`.
    ///
    /// The bytes must decode as an image; nothing is written otherwise.
    /// Files are named by capture time so repeated enrollments accumulate.
    pub fn add_image(&self, label: &str, bytes: &[u8]) -> Result<PathBuf, CorpusError> {
        let label = validate_label(label)?;
        let format = image::guess_format(bytes)?;
        image::load_from_memory_with_format(bytes, format)?;

        let dir = self.root.join(label);
        fs::create_dir_all(&dir)?;

        let ext = format.extensions_str().first().copied().unwrap_or("img");
        let stamp = Local::now().format("%Y%m%d%H%M%S%3f");
        let mut path = dir.join(format!("{stamp}.{ext}"));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("{stamp}_{n}.{ext}"));
            n += 1;
        }

        fs::write(&path, bytes)?;
        tracing::info!(label, path = %path.display(), "stored enrollment image");
        Ok(path)
    }

    /// Delete a label and all of its images.
    pub fn remove_label(&self, label: &str) -> Result<(), CorpusError> {
        let label = validate_label(label)?;
        let dir = self.root.join(label);
        if !dir.is_dir() {
            return Err(CorpusError::LabelNotFound(label.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        tracing::info!(label, "removed label from corpus");
        Ok(())
    }

    fn label_dirs(&self) -> Result<Vec<String>, CorpusError> {
        let unreadable = |source| CorpusError::Unreadable {
            path: self.root.clone(),
            source,
        };
        let mut labels = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            if !target_metadata(&entry.path()).is_some_and(|m| m.is_dir()) {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => labels.push(name),
                Err(name) => tracing::warn!(?name, "skipping non-UTF-8 label directory"),
            }
        }
        labels.sort();
        Ok(labels)
    }
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    let unreadable = |source| CorpusError::Unreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if target_metadata(&path).is_some_and(|m| m.is_file()) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Metadata of what `path` points at, following symlinks. Dangling links yield `None`.
fn target_metadata(path: &Path) -> Option<fs::Metadata> {
    match fs::metadata(path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unresolvable corpus entry");
            None
        }
    }
}
