//! Gallery lifecycle: corpus changes, serialized rebuilds and the load protocol.
//!
//! Readers obtain the gallery through [`GalleryService::current`]:
//!
//! 1. return the in-memory gallery if one is cached;
//! 2. otherwise load the persisted blob and check it against the corpus
//!    fingerprint;
//! 3. if it is missing, corrupt or stale, rebuild once and load again;
//! 4. if that second load fails too, fail the call.
//!
//! Rebuilds hold a single mutex, so at most one runs at a time. A reader
//! that waited on someone else's rebuild reuses its result.

use crate::builder::{BuildError, GalleryBuilder};
use crate::corpus::{Corpus, CorpusError};
use crate::store::{GalleryPersistence, StoreError};
use crate::types::{Gallery, GallerySummary};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery rebuild failed: {0}")]
    Rebuild(#[from] BuildError),
    #[error("gallery unavailable after rebuild: {0}")]
    Unavailable(#[source] StoreError),
}

/// Failure of an enrollment or label removal.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("corpus updated but gallery rebuild failed: {0}")]
    Rebuild(#[from] BuildError),
}

enum LoadFailure {
    Store(StoreError),
    Stale,
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadFailure::Store(e) => write!(f, "{e}"),
            LoadFailure::Stale => f.write_str("gallery is stale against the corpus"),
        }
    }
}

pub struct GalleryService {
    corpus: Corpus,
    store: Box<dyn GalleryPersistence>,
    builder: GalleryBuilder,
    rebuild_lock: Mutex<()>,
    current: RwLock<Option<Arc<Gallery>>>,
    /// Bumped after every successful rebuild.
    generation: AtomicU64,
}

impl GalleryService {
    pub fn new(corpus: Corpus, store: impl GalleryPersistence + 'static, builder: GalleryBuilder) -> Self {
        Self {
            corpus,
            store: Box::new(store),
            builder,
            rebuild_lock: Mutex::new(()),
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// The gallery to match against, following the load protocol.
    pub fn current(&self) -> Result<Arc<Gallery>, GalleryError> {
        if let Some(gallery) = self.cached() {
            return Ok(gallery);
        }

        let seen = self.generation.load(Ordering::SeqCst);
        match self.load_checked() {
            Ok(gallery) => return Ok(self.cache(gallery)),
            Err(reason) => {
                tracing::warn!(store = %self.store.location(), %reason, "gallery unusable; rebuilding")
            }
        }

        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != seen {
            if let Some(gallery) = self.cached() {
                return Ok(gallery);
            }
        }

        self.rebuild_locked()?;
        match self.store.load() {
            Ok(gallery) => Ok(self.cache(gallery)),
            Err(e) => {
                tracing::error!(error = %e, "gallery still unreadable after rebuild");
                Err(GalleryError::Unavailable(e))
            }
        }
    }

    /// Rebuild from the corpus and persist.
    ///
    /// On failure the persisted blob and the cached gallery are untouched.
    pub fn rebuild(&self) -> Result<Arc<Gallery>, BuildError> {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.rebuild_locked()
    }

    /// Store an image under `label`, then rebuild.
    pub fn enroll_image(&self, label: &str, bytes: &[u8]) -> Result<Arc<Gallery>, UpdateError> {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.corpus.add_image(label, bytes)?;
        Ok(self.rebuild_locked()?)
    }

    /// Delete `label` from the corpus, then rebuild.
    pub fn remove_label(&self, label: &str) -> Result<Arc<Gallery>, UpdateError> {
        let _guard = self.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.corpus.remove_label(label)?;
        Ok(self.rebuild_locked()?)
    }

    pub fn labels(&self) -> Result<BTreeMap<String, usize>, CorpusError> {
        self.corpus.labels()
    }

    /// Summary of the cached gallery, without touching disk.
    pub fn cached_summary(&self) -> Option<GallerySummary> {
        self.cached().map(|g| g.summary())
    }

    fn rebuild_locked(&self) -> Result<Arc<Gallery>, BuildError> {
        let gallery = self.builder.build(&self.corpus)?;
        self.store.save(&gallery)?;
        let gallery = self.cache(gallery);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(gallery)
    }

    fn load_checked(&self) -> Result<Gallery, LoadFailure> {
        let gallery = self.store.load().map_err(LoadFailure::Store)?;
        match self.corpus.fingerprint() {
            Ok(live) if gallery.fingerprint.as_deref() != Some(live.as_str()) => Err(LoadFailure::Stale),
            Ok(_) => Ok(gallery),
            Err(e) => {
                tracing::warn!(error = %e, "cannot fingerprint corpus; using persisted gallery as-is");
                Ok(gallery)
            }
        }
    }

    fn cached(&self) -> Option<Arc<Gallery>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn cache(&self, gallery: Gallery) -> Arc<Gallery> {
        let gallery = Arc::new(gallery);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(gallery.clone());
        gallery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GalleryStore;
    use crate::testing::{png_bytes, write_png, ColorExtractor, RaggedExtractor};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn service(root: &Path) -> (GalleryService, Arc<ColorExtractor>) {
        let extractor = Arc::new(ColorExtractor::default());
        let svc = GalleryService::new(
            Corpus::new(root.join("images")),
            GalleryStore::new(root.join("gallery.json")),
            GalleryBuilder::new(extractor.clone()),
        );
        (svc, extractor)
    }

    fn calls(extractor: &ColorExtractor) -> usize {
        extractor.calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_missing_gallery_built_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (svc, _) = service(dir.path());

        let gallery = svc.current().unwrap();
        assert_eq!(gallery.len(), 1);
        assert!(dir.path().join("gallery.json").exists());
    }

    #[test]
    fn test_current_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (svc, extractor) = service(dir.path());

        svc.current().unwrap();
        svc.current().unwrap();
        assert_eq!(calls(&extractor), 1);
    }

    #[test]
    fn test_fresh_persisted_gallery_is_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (first, _) = service(dir.path());
        first.rebuild().unwrap();

        let (second, extractor) = service(dir.path());
        assert_eq!(second.current().unwrap().len(), 1);
        assert_eq!(calls(&extractor), 0);
    }

    #[test]
    fn test_corrupt_gallery_rebuilt_once() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        fs::write(dir.path().join("gallery.json"), b"not json").unwrap();
        let (svc, extractor) = service(dir.path());

        assert_eq!(svc.current().unwrap().len(), 1);
        assert_eq!(calls(&extractor), 1);
        svc.store.load().unwrap();
    }

    #[test]
    fn test_stale_gallery_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (first, _) = service(dir.path());
        first.rebuild().unwrap();

        write_png(&dir.path().join("images/bob/1.png"), [0, 0, 200]);
        let (second, extractor) = service(dir.path());
        let gallery = second.current().unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(calls(&extractor), 2);
    }

    #[test]
    fn test_unreadable_corpus_fails_load_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _) = service(dir.path());
        assert!(matches!(svc.current(), Err(GalleryError::Rebuild(BuildError::Corpus(_)))));
    }

    #[test]
    fn test_failed_persist_preserves_previous_gallery() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (svc, _) = service(dir.path());
        svc.rebuild().unwrap();

        write_png(&dir.path().join("images/bob/1.png"), [0, 0, 200]);
        fs::create_dir(dir.path().join("gallery.json.tmp")).unwrap();
        let err = svc.rebuild().unwrap_err();
        assert!(matches!(err, BuildError::Persist(_)));

        assert_eq!(svc.store.load().unwrap().len(), 1);
        assert_eq!(svc.current().unwrap().len(), 1);
    }

    #[test]
    fn test_enroll_and_remove_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        let (svc, _) = service(dir.path());

        let gallery = svc.enroll_image("carol", &png_bytes([30, 160, 90])).unwrap();
        assert_eq!(gallery.label_counts().get("carol"), Some(&1));
        assert_eq!(svc.labels().unwrap().get("carol"), Some(&1));

        let gallery = svc.remove_label("carol").unwrap();
        assert!(gallery.is_empty());
        assert!(svc.current().unwrap().is_empty());
    }

    #[test]
    fn test_enroll_undecodable_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (svc, extractor) = service(dir.path());

        let err = svc.enroll_image("alice", b"garbage").unwrap_err();
        assert!(matches!(err, UpdateError::Corpus(CorpusError::Decode(_))));
        assert_eq!(svc.labels().unwrap().get("alice"), Some(&1));
        assert_eq!(calls(&extractor), 0);
    }

    #[test]
    fn test_remove_unknown_label() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        let (svc, _) = service(dir.path());
        let err = svc.remove_label("nobody").unwrap_err();
        assert!(matches!(err, UpdateError::Corpus(CorpusError::LabelNotFound(_))));
    }

    #[test]
    fn test_concurrent_first_use_builds_once() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let (svc, extractor) = service(dir.path());
        let svc = Arc::new(svc);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                std::thread::spawn(move || svc.current().unwrap().len())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
        assert_eq!(calls(&extractor), 1);
    }

    #[test]
    fn test_mixed_descriptor_lengths_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [220, 220, 220]);
        write_png(&dir.path().join("images/bob/1.png"), [30, 30, 30]);
        let ragged = || {
            GalleryService::new(
                Corpus::new(dir.path().join("images")),
                GalleryStore::new(dir.path().join("gallery.json")),
                GalleryBuilder::new(Arc::new(RaggedExtractor)),
            )
        };

        assert_eq!(ragged().rebuild().unwrap().len(), 1);
        file_store(dir.path()).load().unwrap();
        assert_eq!(ragged().current().unwrap().label_counts().get("alice"), Some(&1));
    }

    fn file_store(root: &Path) -> GalleryStore {
        GalleryStore::new(root.join("gallery.json"))
    }

    /// Accepts every save, yet never yields a readable gallery.
    #[derive(Default)]
    struct WriteOnlyStore {
        saves: Arc<AtomicUsize>,
    }

    impl GalleryPersistence for WriteOnlyStore {
        fn load(&self) -> Result<Gallery, StoreError> {
            Err(StoreError::Corrupt { path: "write-only".into(), reason: "unreadable".into() })
        }

        fn save(&self, _: &Gallery) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn location(&self) -> String {
            "write-only".into()
        }
    }

    #[test]
    fn test_second_load_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [200, 0, 0]);
        let store = WriteOnlyStore::default();
        let saves = store.saves.clone();
        let extractor = Arc::new(ColorExtractor::default());
        let svc = GalleryService::new(
            Corpus::new(dir.path().join("images")),
            store,
            GalleryBuilder::new(extractor.clone()),
        );

        let err = svc.current().unwrap_err();
        assert!(matches!(err, GalleryError::Unavailable(StoreError::Corrupt { .. })));
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert_eq!(calls(&extractor), 1);
    }
}
