//! Shared fixtures for unit tests.

use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::types::Descriptor;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn solid(rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(16, 16, Rgb(rgb))
}

pub fn png_bytes(rgb: [u8; 3]) -> Vec<u8> {
    let mut buf = Vec::new();
    solid(rgb)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn write_png(path: &Path, rgb: [u8; 3]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    solid(rgb).save_with_format(path, ImageFormat::Png).unwrap();
}

pub fn write_garbage(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"\x89PNG but not really").unwrap();
}

/// Colour of a pixel as a 3-d descriptor in [0, 1].
pub fn color_descriptor(rgb: [u8; 3]) -> Descriptor {
    Descriptor::new(rgb.iter().map(|&c| c as f32 / 255.0).collect())
}

/// Deterministic stand-in for a face model.
///
/// Black images have no face. Otherwise the top-left pixel is one face and
/// a differently coloured, non-black top-right pixel is a second face.
#[derive(Default)]
pub struct ColorExtractor {
    pub calls: AtomicUsize,
}

impl DescriptorExtractor for ColorExtractor {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = image.get_pixel(0, 0).0;
        if first == [0, 0, 0] {
            return Ok(Vec::new());
        }
        let mut faces = vec![color_descriptor(first)];
        let second = image.get_pixel(image.width() - 1, 0).0;
        if second != first && second != [0, 0, 0] {
            faces.push(color_descriptor(second));
        }
        Ok(faces)
    }
}

/// Extractor whose model always fails.
pub struct FailingExtractor;

impl DescriptorExtractor for FailingExtractor {
    fn detect_and_encode(&self, _image: &RgbImage) -> Result<Vec<Descriptor>, ExtractorError> {
        Err(ExtractorError::InferenceFailed("model exploded".into()))
    }
}

/// Colour extractor whose descriptors are 3-d for bright images and 2-d for dark ones.
pub struct RaggedExtractor;

impl DescriptorExtractor for RaggedExtractor {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractorError> {
        let px = image.get_pixel(0, 0).0;
        if px == [0, 0, 0] {
            return Ok(Vec::new());
        }
        let mut d = color_descriptor(px);
        if px.iter().map(|&c| c as u32).sum::<u32>() < 3 * 128 {
            d.values.truncate(2);
        }
        Ok(vec![d])
    }
}
