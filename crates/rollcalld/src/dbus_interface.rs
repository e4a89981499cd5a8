use rollcall_core::builder::BuildError;
use rollcall_core::capture::{CaptureError, SourceError};
use rollcall_core::corpus::CorpusError;
use rollcall_core::gallery::UpdateError;
use rollcall_core::Attendance;
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    attendance: Arc<Attendance>,
}

impl RollcallService {
    pub fn new(attendance: Arc<Attendance>) -> Self {
        Self { attendance }
    }

    /// Run `f` on the blocking pool; gallery builds and thread joins must not stall the bus.
    async fn blocking<T, F>(&self, f: F) -> fdo::Result<T>
    where
        F: FnOnce(&Attendance) -> fdo::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let attendance = self.attendance.clone();
        tokio::task::spawn_blocking(move || f(&attendance))
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Rebuild the gallery from the corpus. Returns the gallery summary as JSON.
    async fn rebuild_gallery(&self) -> fdo::Result<String> {
        tracing::info!("rebuild requested");
        self.blocking(|a| {
            let summary = a.rebuild_gallery().map_err(build_error)?;
            to_json(&summary)
        })
        .await
    }

    /// Add one image to the corpus under `label`, then rebuild.
    async fn enroll_image(&self, label: String, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(label = %label, bytes = image.len(), "enroll requested");
        self.blocking(move |a| {
            let summary = a.enroll_image(&label, &image).map_err(update_error)?;
            to_json(&summary)
        })
        .await
    }

    /// Delete every corpus image of `label`, then rebuild.
    async fn remove_label(&self, label: String) -> fdo::Result<String> {
        tracing::info!(label = %label, "remove requested");
        self.blocking(move |a| {
            let summary = a.remove_label(&label).map_err(update_error)?;
            to_json(&summary)
        })
        .await
    }

    /// Image count per enrolled label, as a JSON object.
    async fn list_labels(&self) -> fdo::Result<String> {
        self.blocking(|a| {
            let labels = a.list_labels().map_err(corpus_error)?;
            to_json(&labels)
        })
        .await
    }

    /// Start the capture loop. Returns false if it was already running.
    async fn start_capture(&self) -> fdo::Result<bool> {
        tracing::info!("start capture requested");
        self.blocking(|a| a.start_capture().map_err(capture_error)).await
    }

    /// Stop the capture loop and release the camera. Returns false if it was not running.
    async fn stop_capture(&self) -> fdo::Result<bool> {
        tracing::info!("stop capture requested");
        self.blocking(|a| Ok(a.stop_capture())).await
    }

    /// Latest captured frame as JPEG bytes; empty before the first frame.
    async fn current_frame(&self) -> Vec<u8> {
        self.attendance
            .current_frame()
            .map(|jpeg| jpeg.to_vec())
            .unwrap_or_default()
    }

    /// Attendance records of the current session, as a JSON array.
    async fn attendance_snapshot(&self) -> fdo::Result<String> {
        to_json(&self.attendance.attendance_snapshot())
    }

    /// Labels newly marked by the most recent tick that marked anyone.
    async fn attendance_delta(&self) -> Vec<String> {
        self.attendance.attendance_delta()
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let report = self.attendance.status();
        let mut value = serde_json::to_value(&report).map_err(|e| fdo::Error::Failed(e.to_string()))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn corpus_error(e: CorpusError) -> fdo::Error {
    match e {
        CorpusError::InvalidLabel(_) | CorpusError::Decode(_) => fdo::Error::InvalidArgs(e.to_string()),
        CorpusError::LabelNotFound(_) => fdo::Error::FileNotFound(e.to_string()),
        _ => fdo::Error::Failed(e.to_string()),
    }
}

fn build_error(e: BuildError) -> fdo::Error {
    tracing::error!(error = %e, "gallery rebuild failed");
    fdo::Error::Failed(e.to_string())
}

fn update_error(e: UpdateError) -> fdo::Error {
    match e {
        UpdateError::Corpus(e) => corpus_error(e),
        UpdateError::Rebuild(e) => build_error(e),
    }
}

fn capture_error(e: CaptureError) -> fdo::Error {
    tracing::warn!(error = %e, "capture start failed");
    match e {
        CaptureError::Source(SourceError::DeviceNotFound(_)) => fdo::Error::FileNotFound(e.to_string()),
        _ => fdo::Error::Failed(e.to_string()),
    }
}
