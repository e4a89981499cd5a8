//! V4L2 camera capture via the `v4l` crate.

use crate::frame;
use image::RgbImage;
use rollcall_core::capture::{FrameSource, FrameStream, ReadOutcome, SourceError};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for SourceError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceNotFound(p) => SourceError::DeviceNotFound(p),
            CameraError::DeviceBusy(p) => SourceError::DeviceBusy(p),
            other => SourceError::Open(other.to_string()),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpg)
        } else {
            None
        }
    }
}

/// An open V4L2 camera, streaming through memory-mapped buffers.
pub struct Camera {
    // Field order matters: the stream must be dropped before the device.
    stream: MmapStream<'static>,
    _device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera by path (e.g. "/dev/video0") and start streaming.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(libc::EBUSY) => CameraError::DeviceBusy(device_path.to_string()),
            Some(libc::ENOENT) | Some(libc::ENODEV) => {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
            _ => CameraError::CaptureFailed(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; webcams that only stream MJPG at this size answer with MJPG.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or MJPG)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EBUSY) => CameraError::DeviceBusy(device_path.to_string()),
                _ => CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")),
            })?;

        Ok(Self {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Dequeue the next buffer and convert it to RGB.
    pub fn capture_frame(&mut self) -> io::Result<Result<RgbImage, frame::FrameError>> {
        let (buf, _meta) = self.stream.next()?;
        Ok(match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Mjpg => frame::decode_mjpeg(buf, self.width, self.height),
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameStream for Camera {
    fn read(&mut self) -> ReadOutcome {
        match self.capture_frame() {
            Ok(Ok(frame)) => ReadOutcome::Frame(frame),
            Ok(Err(e)) => ReadOutcome::Transient(e.to_string()),
            Err(e) => classify_read_error(&e),
        }
    }
}

/// Unplugging the camera is final; everything else is worth another try.
fn classify_read_error(e: &io::Error) -> ReadOutcome {
    match e.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENXIO) => ReadOutcome::EndOfStream,
        _ => ReadOutcome::Transient(e.to_string()),
    }
}

/// Camera configuration; the device is only opened when capture starts.
#[derive(Debug, Clone)]
pub struct V4lSource {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl V4lSource {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }
}

impl FrameSource for V4lSource {
    fn open(&self) -> Result<Box<dyn FrameStream>, SourceError> {
        let camera = Camera::open(&self.device_path, self.width, self.height)?;
        Ok(Box::new(camera))
    }

    fn describe(&self) -> String {
        format!("v4l2:{} {}x{}", self.device_path, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_maps_to_not_found() {
        let source = V4lSource::new("/dev/rollcall-no-such-video", 640, 480);
        let err = source.open().err().expect("open must fail");
        assert!(matches!(err, SourceError::DeviceNotFound(p) if p.contains("no-such-video")));
    }

    #[test]
    fn test_read_errors_classified() {
        let unplugged = io::Error::from_raw_os_error(libc::ENODEV);
        assert!(matches!(classify_read_error(&unplugged), ReadOutcome::EndOfStream));

        let again = io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(matches!(classify_read_error(&again), ReadOutcome::Transient(_)));

        let interrupted = io::Error::from_raw_os_error(libc::EINTR);
        assert!(matches!(classify_read_error(&interrupted), ReadOutcome::Transient(_)));
    }

    #[test]
    fn test_fourcc_support() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), None);
    }

    #[test]
    fn test_camera_error_into_source_error() {
        let busy: SourceError = CameraError::DeviceBusy("/dev/video0".into()).into();
        assert!(matches!(busy, SourceError::DeviceBusy(_)));
        let other: SourceError = CameraError::StreamingNotSupported.into();
        assert!(matches!(other, SourceError::Open(_)));
    }
}
