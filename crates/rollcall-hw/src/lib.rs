//! rollcall-hw — Frame sources for the capture loop.
//!
//! A V4L2 camera via the `v4l` crate, and a directory replay source for
//! demos and tests.

pub mod camera;
pub mod frame;
pub mod replay;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4lSource};
pub use replay::ReplaySource;
