//! The capture loop: frames in, attendance marks and a live JPEG frame out.
//!
//! The loop runs on one dedicated OS thread. It is the only writer of the
//! [`FrameBuffer`] and the [`AttendanceSession`]; readers never block it for
//! longer than a pointer swap.

use crate::recognizer::FrameRecognizer;
use crate::session::AttendanceSession;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Pause after a transient read failure before trying again.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("failed to open frame source: {0}")]
    Open(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Error, Debug)]
#[error("frame encoding failed: {0}")]
pub struct EncodeError(#[from] image::ImageError);

/// Result of one read from an open frame stream.
pub enum ReadOutcome {
    Frame(RgbImage),
    /// The source is closed for good; the loop ends.
    EndOfStream,
    /// This read failed but the next one may succeed.
    Transient(String),
}

/// Something that can be opened into a stream of frames.
pub trait FrameSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameStream>, SourceError>;

    fn describe(&self) -> String;
}

/// An open frame stream. Dropping it releases the underlying device.
pub trait FrameStream: Send {
    fn read(&mut self) -> ReadOutcome;
}

/// Encode a frame as JPEG for streaming.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(frame)?;
    Ok(buf)
}

/// The most recent encoded frame.
///
/// Publishing swaps an `Arc`; reading clones one. The lock is never held
/// while a frame is captured or encoded.
#[derive(Default)]
pub struct FrameBuffer {
    latest: Mutex<Option<Arc<[u8]>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Vec<u8>) {
        let frame: Arc<[u8]> = frame.into();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn latest(&self) -> Option<Arc<[u8]>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Counters for the current capture run.
#[derive(Default)]
pub struct CaptureStats {
    frames: AtomicU64,
    transient_errors: AtomicU64,
    recognize_failures: AtomicU64,
    marks: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CaptureStatsSnapshot {
    pub frames: u64,
    pub transient_errors: u64,
    pub recognize_failures: u64,
    pub marks: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            recognize_failures: self.recognize_failures.load(Ordering::Relaxed),
            marks: self.marks.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.frames.store(0, Ordering::Relaxed);
        self.transient_errors.store(0, Ordering::Relaxed);
        self.recognize_failures.store(0, Ordering::Relaxed);
        self.marks.store(0, Ordering::Relaxed);
    }
}

/// Everything the loop thread needs, shared with the controller.
struct LoopShared {
    active: AtomicBool,
    recognizer: FrameRecognizer,
    session: Arc<AttendanceSession>,
    frames: Arc<FrameBuffer>,
    stats: CaptureStats,
    jpeg_quality: u8,
}

/// Starts and stops the capture loop thread.
pub struct CaptureController {
    source: Box<dyn FrameSource>,
    shared: Arc<LoopShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureController {
    pub fn new(
        source: Box<dyn FrameSource>,
        recognizer: FrameRecognizer,
        session: Arc<AttendanceSession>,
        frames: Arc<FrameBuffer>,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            source,
            shared: Arc::new(LoopShared {
                active: AtomicBool::new(false),
                recognizer,
                session,
                frames,
                stats: CaptureStats::default(),
                jpeg_quality,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start capturing. Returns `false` if a loop is already running.
    ///
    /// The source is opened here so open failures reach the caller. The
    /// attendance session is reset for the new run.
    pub fn start(&self) -> Result<bool, CaptureError> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(h) = handle.as_ref() {
            if !h.is_finished() && self.shared.active.load(Ordering::SeqCst) {
                tracing::debug!("capture already running");
                return Ok(false);
            }
        }
        // Reap a loop that ended on its own (end of stream).
        if let Some(h) = handle.take() {
            self.shared.active.store(false, Ordering::SeqCst);
            join(h);
        }

        let stream = self.source.open()?;
        tracing::info!(source = %self.source.describe(), "frame source opened");

        self.shared.session.reset();
        self.shared.frames.clear();
        self.shared.stats.reset();
        self.shared.active.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || run_loop(stream, &shared));

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(true)
            }
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                Err(CaptureError::Spawn(e))
            }
        }
    }

    /// Stop capturing and wait for the loop to release the frame source.
    ///
    /// Returns `false` if nothing was running.
    pub fn stop(&self) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let was_active = self.shared.active.swap(false, Ordering::SeqCst);
        if let Some(h) = handle.take() {
            join(h);
        }
        if was_active {
            tracing::info!("capture stopped");
        }
        was_active
    }

    pub fn is_running(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::error!("capture thread panicked");
    }
}

/// Clears the running flag when the capture thread leaves `run_loop`, unwinding included.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Body of the capture thread. Owns the stream; it is dropped on return.
fn run_loop(stream: Box<dyn FrameStream>, shared: &LoopShared) {
    let _active = ActiveGuard(&shared.active);
    // Declared after the guard so the source is released before the flag clears.
    let mut stream = stream;
    tracing::info!("capture loop started");

    while shared.active.load(Ordering::SeqCst) {
        match stream.read() {
            ReadOutcome::Frame(frame) => tick(&frame, shared),
            ReadOutcome::Transient(reason) => {
                shared.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%reason, "transient frame read failure; retrying");
                std::thread::sleep(TRANSIENT_BACKOFF);
            }
            ReadOutcome::EndOfStream => {
                tracing::info!("frame source closed");
                break;
            }
        }
    }

    drop(stream);
    tracing::info!(frames = shared.stats.frames.load(Ordering::Relaxed), "capture loop exited; source released");
}

fn tick(frame: &RgbImage, shared: &LoopShared) {
    shared.stats.frames.fetch_add(1, Ordering::Relaxed);

    let identities = match shared.recognizer.recognize(frame) {
        Ok(ids) => ids,
        Err(e) => {
            shared.stats.recognize_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "recognition failed; treating frame as empty");
            Vec::new()
        }
    };

    let fresh = shared
        .session
        .mark_tick(identities.iter().filter_map(|id| id.label()));
    shared.stats.marks.fetch_add(fresh.len() as u64, Ordering::Relaxed);

    match encode_jpeg(frame, shared.jpeg_quality) {
        Ok(jpeg) => shared.frames.publish(jpeg),
        Err(e) => tracing::warn!(error = %e, "dropping frame from live feed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GalleryBuilder;
    use crate::corpus::Corpus;
    use crate::extractor::{DescriptorExtractor, ExtractorError};
    use crate::gallery::GalleryService;
    use crate::recognizer::RecognizerConfig;
    use crate::store::GalleryStore;
    use crate::testing::{solid, write_png, ColorExtractor};
    use crate::types::Descriptor;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::time::Instant;

    /// Scripted source; `released` flips when the stream is dropped.
    struct ScriptSource {
        script: Vec<Script>,
        repeat_last: bool,
        released: Arc<AtomicBool>,
        opens: Arc<AtomicU64>,
    }

    #[derive(Clone)]
    enum Script {
        Frame([u8; 3]),
        Transient,
        End,
    }

    struct ScriptStream {
        steps: VecDeque<Script>,
        last: Option<Script>,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptSource {
        fn open(&self) -> Result<Box<dyn FrameStream>, SourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.released.store(false, Ordering::SeqCst);
            Ok(Box::new(ScriptStream {
                steps: self.script.iter().cloned().collect(),
                last: if self.repeat_last { self.script.last().cloned() } else { None },
                released: self.released.clone(),
            }))
        }

        fn describe(&self) -> String {
            "script".into()
        }
    }

    impl FrameStream for ScriptStream {
        fn read(&mut self) -> ReadOutcome {
            let step = self.steps.pop_front().or_else(|| self.last.clone());
            std::thread::sleep(Duration::from_millis(1));
            match step {
                Some(Script::Frame(rgb)) => ReadOutcome::Frame(solid(rgb)),
                Some(Script::Transient) => ReadOutcome::Transient("glitch".into()),
                Some(Script::End) | None => ReadOutcome::EndOfStream,
            }
        }
    }

    impl Drop for ScriptStream {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct Rig {
        controller: CaptureController,
        session: Arc<AttendanceSession>,
        frames: Arc<FrameBuffer>,
        released: Arc<AtomicBool>,
        opens: Arc<AtomicU64>,
    }

    fn rig(root: &Path, script: Vec<Script>, repeat_last: bool) -> Rig {
        rig_with(root, script, repeat_last, Arc::new(ColorExtractor::default()))
    }

    /// Rig whose recognizer uses `frame_extractor`; the gallery is always built with colours.
    fn rig_with(
        root: &Path,
        script: Vec<Script>,
        repeat_last: bool,
        frame_extractor: Arc<dyn DescriptorExtractor>,
    ) -> Rig {
        let gallery = Arc::new(GalleryService::new(
            Corpus::new(root.join("images")),
            GalleryStore::new(root.join("gallery.json")),
            GalleryBuilder::new(Arc::new(ColorExtractor::default())),
        ));
        let recognizer = FrameRecognizer::new(gallery, frame_extractor, RecognizerConfig::default());
        let released = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(AtomicU64::new(0));
        let source = ScriptSource {
            script,
            repeat_last,
            released: released.clone(),
            opens: opens.clone(),
        };
        let session = Arc::new(AttendanceSession::new());
        let frames = Arc::new(FrameBuffer::new());
        let controller = CaptureController::new(
            Box::new(source),
            recognizer,
            session.clone(),
            frames.clone(),
            DEFAULT_JPEG_QUALITY,
        );
        Rig { controller, session, frames, released, opens }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_encode_jpeg_roundtrips_dimensions() {
        let jpeg = encode_jpeg(&solid([10, 20, 30]), 80).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn test_frame_buffer_supersedes() {
        let buf = FrameBuffer::new();
        assert!(buf.latest().is_none());
        buf.publish(vec![1, 2]);
        buf.publish(vec![3]);
        assert_eq!(buf.latest().as_deref(), Some(&[3u8][..]));
        buf.clear();
        assert!(buf.latest().is_none());
    }

    #[test]
    fn test_end_of_stream_marks_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [220, 30, 30]);
        let script = vec![
            Script::Frame([90, 90, 90]),
            Script::Transient,
            Script::Frame([218, 32, 30]),
            Script::Frame([218, 32, 30]),
            Script::End,
        ];
        let rig = rig(dir.path(), script, false);

        assert!(rig.controller.start().unwrap());
        wait_until(|| !rig.controller.is_running());
        assert!(rig.released.load(Ordering::SeqCst));

        let records = rig.session.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "alice");
        assert_eq!(rig.session.recent_delta(), vec!["alice"]);

        let stats = rig.controller.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.transient_errors, 1);
        assert_eq!(stats.marks, 1);

        let jpeg = rig.frames.latest().expect("a published frame");
        image::load_from_memory(&jpeg).unwrap();
    }

    #[test]
    fn test_start_is_idempotent_and_stop_releases() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [220, 30, 30]);
        let rig = rig(dir.path(), vec![Script::Frame([218, 32, 30])], true);

        assert!(rig.controller.start().unwrap());
        assert!(!rig.controller.start().unwrap());
        assert_eq!(rig.opens.load(Ordering::SeqCst), 1);

        wait_until(|| rig.session.len() == 1);
        assert!(rig.controller.stop());
        assert!(rig.released.load(Ordering::SeqCst));
        assert!(!rig.controller.is_running());
        assert!(!rig.controller.stop());
    }

    #[test]
    fn test_restart_resets_session() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [220, 30, 30]);
        let rig = rig(dir.path(), vec![Script::Frame([218, 32, 30])], true);

        rig.controller.start().unwrap();
        wait_until(|| rig.session.len() == 1);
        rig.controller.stop();
        let first = rig.session.snapshot()[0].marked_at;

        rig.controller.start().unwrap();
        wait_until(|| rig.session.len() == 1 && rig.session.snapshot()[0].marked_at != first);
        rig.controller.stop();
        assert_eq!(rig.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_gallery_failure_does_not_stop_loop() {
        let dir = tempfile::tempdir().unwrap();
        // No corpus directory: every gallery load and rebuild fails.
        let rig = rig(dir.path(), vec![Script::Frame([218, 32, 30])], true);

        rig.controller.start().unwrap();
        wait_until(|| rig.controller.stats().recognize_failures >= 3);
        assert!(rig.controller.is_running());
        assert!(rig.frames.latest().is_some());
        rig.controller.stop();
    }

    #[test]
    fn test_concurrent_frame_reads_are_whole() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        let script = (0..40u8)
            .map(|i| Script::Frame([i * 6, 255 - i * 6, 128]))
            .chain(std::iter::once(Script::End))
            .collect();
        let rig = rig(dir.path(), script, false);
        let frames = rig.frames.clone();

        rig.controller.start().unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let frames = frames.clone();
                std::thread::spawn(move || {
                    let mut seen = 0;
                    for _ in 0..200 {
                        if let Some(jpeg) = frames.latest() {
                            let img = image::load_from_memory(&jpeg).expect("complete JPEG");
                            assert_eq!(img.width(), 16);
                            seen += 1;
                        }
                        std::thread::sleep(Duration::from_micros(200));
                    }
                    seen
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
        wait_until(|| !rig.controller.is_running());
        assert!(rig.frames.latest().is_some());
    }

    /// Colour extractor that panics on a grey [13, 13, 13] frame.
    #[derive(Default)]
    struct PanickingExtractor(ColorExtractor);

    impl DescriptorExtractor for PanickingExtractor {
        fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractorError> {
            if image.get_pixel(0, 0).0 == [13, 13, 13] {
                panic!("extractor blew up");
            }
            self.0.detect_and_encode(image)
        }
    }

    #[test]
    fn test_panicking_tick_clears_running_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("images/alice/1.png"), [220, 30, 30]);
        let script = vec![Script::Frame([218, 32, 30]), Script::Frame([13, 13, 13])];
        let rig = rig_with(dir.path(), script, true, Arc::new(PanickingExtractor::default()));

        assert!(rig.controller.start().unwrap());
        wait_until(|| !rig.controller.is_running());
        assert!(rig.released.load(Ordering::SeqCst));
        assert_eq!(rig.session.snapshot()[0].label, "alice");

        // The dead loop is reaped and a fresh one starts.
        assert!(rig.controller.start().unwrap());
        assert_eq!(rig.opens.load(Ordering::SeqCst), 2);
        wait_until(|| !rig.controller.is_running());
        assert!(!rig.controller.stop());
    }
}
