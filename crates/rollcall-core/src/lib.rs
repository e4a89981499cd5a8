//! rollcall-core — Face gallery maintenance, matching and attendance capture.
//!
//! The gallery is built from a labelled image corpus and persisted as a
//! versioned blob. Live frames are matched against it by Euclidean distance
//! and each recognised label is marked present once per capture session.

pub mod attendance;
pub mod builder;
pub mod capture;
pub mod corpus;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod onnx;
pub mod recognizer;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{Attendance, AttendanceConfig, AttendanceStatusReport};
pub use capture::{FrameSource, FrameStream, ReadOutcome, SourceError};
pub use extractor::{DescriptorExtractor, ExtractorError};
pub use onnx::OnnxExtractor;
pub use types::{AttendanceRecord, Descriptor, Gallery, GallerySummary, Identity};
