//! ONNX Runtime descriptor extractor: SCRFD detection + ArcFace embedding.
//!
//! Faces are detected on a letterboxed 640×640 RGB input, aligned to the
//! canonical 112×112 ArcFace pose from their five landmarks, and embedded
//! into L2-normalised 512-d descriptors.

use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::types::Descriptor;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

const DET_INPUT_SIZE: u32 = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_SCORE_THRESHOLD: f32 = 0.5;
const DET_NMS_THRESHOLD: f32 = 0.4;
const DET_STRIDES: [u32; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

const EMB_INPUT_SIZE: u32 = 112;
const EMB_MEAN: f32 = 127.5;
const EMB_STD: f32 = 127.5;
const EMB_DIM: usize = 512;

/// Landmark positions of an aligned 112×112 face: eyes, nose, mouth corners.
const ALIGNED_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

#[derive(Debug, Clone, PartialEq)]
struct DetectedFace {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: [(f32, f32); 5],
}

/// 2×2 rotation-scale plus translation: `dst = [a -b; b a]·src + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares similarity mapping `src` onto `dst`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for ((sx, sy), (dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy, dx, dy) = (sx - msx, sy - msy, dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm <= f32::EPSILON {
            return Self { a: 1.0, b: 0.0, tx: mdx - msx, ty: mdy - msy };
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (x, y) = (x - self.tx, y - self.ty);
        ((self.a * x + self.b * y) / det, (-self.b * x + self.a * y) / det)
    }
}

pub struct OnnxExtractor {
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
}

impl OnnxExtractor {
    /// Load both models from `model_dir` using their standard file names.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        Self::load_files(&model_dir.join(DETECTOR_MODEL_FILE), &model_dir.join(EMBEDDER_MODEL_FILE))
    }

    pub fn load_files(detector_path: &Path, embedder_path: &Path) -> Result<Self, ExtractorError> {
        let detector = open_session(detector_path)?;
        let outputs = detector.outputs().len();
        if outputs < 9 {
            return Err(ExtractorError::InferenceFailed(format!(
                "detector needs 9 outputs (score/bbox/kps × 3 strides), got {outputs}"
            )));
        }
        let embedder = open_session(embedder_path)?;

        tracing::info!(
            detector = %detector_path.display(),
            embedder = %embedder_path.display(),
            "face models loaded"
        );
        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
        })
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError> {
        let (input, scale) = letterbox(image);

        let mut session = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (pos, &stride) in DET_STRIDES.iter().enumerate() {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| ExtractorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = tensor(pos, "scores")?;
            let boxes = tensor(pos + 3, "boxes")?;
            let kps = tensor(pos + 6, "landmarks")?;
            faces.extend(decode_stride(scores, boxes, kps, stride, scale));
        }

        Ok(nms(faces, DET_NMS_THRESHOLD))
    }

    fn embed(&self, image: &RgbImage, face: &DetectedFace) -> Result<Descriptor, ExtractorError> {
        let aligned = align(image, &face.landmarks);
        let input = embedder_tensor(&aligned);

        let mut session = self.embedder.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != EMB_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {EMB_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Descriptor::new(l2_normalize(raw)))
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<Descriptor>, ExtractorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let faces = self.detect(image)?;
        tracing::trace!(faces = faces.len(), "faces detected");
        faces.iter().map(|face| self.embed(image, face)).collect()
    }
}

fn open_session(path: &Path) -> Result<Session, ExtractorError> {
    if !path.exists() {
        return Err(ExtractorError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    Ok(session)
}

fn letterbox_scale(width: u32, height: u32) -> f32 {
    (DET_INPUT_SIZE as f32 / width as f32).min(DET_INPUT_SIZE as f32 / height as f32)
}

/// Resize into the top-left corner of the detector input, padding with the mean.
fn letterbox(image: &RgbImage) -> (Array4<f32>, f32) {
    let scale = letterbox_scale(image.width(), image.height());
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, DET_INPUT_SIZE);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, DET_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = DET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, Rgb(px)) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - DET_MEAN) / DET_STD;
        }
    }
    (tensor, scale)
}

fn decode_stride(scores: &[f32], boxes: &[f32], kps: &[f32], stride: u32, scale: f32) -> Vec<DetectedFace> {
    let grid = (DET_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * DET_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut faces = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= DET_SCORE_THRESHOLD {
            continue;
        }
        let (b, k) = (idx * 4, idx * 10);
        if b + 4 > boxes.len() || k + 10 > kps.len() {
            continue;
        }

        let cell = idx / DET_ANCHORS_PER_CELL;
        let cx = (cell % grid) as f32 * s;
        let cy = (cell / grid) as f32 * s;

        let mut landmarks = [(0.0f32, 0.0f32); 5];
        for (i, lm) in landmarks.iter_mut().enumerate() {
            *lm = (
                (cx + kps[k + i * 2] * s) / scale,
                (cy + kps[k + i * 2 + 1] * s) / scale,
            );
        }

        faces.push(DetectedFace {
            x1: (cx - boxes[b] * s) / scale,
            y1: (cy - boxes[b + 1] * s) / scale,
            x2: (cx + boxes[b + 2] * s) / scale,
            y2: (cy + boxes[b + 3] * s) / scale,
            score,
            landmarks,
        });
    }
    faces
}

fn iou(a: &DetectedFace, b: &DetectedFace) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Greedy non-maximum suppression. Output is sorted by descending score.
fn nms(mut faces: Vec<DetectedFace>, threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<DetectedFace> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| iou(k, &face) <= threshold) {
            keep.push(face);
        }
    }
    keep
}

/// Warp the face to the canonical 112×112 pose with bilinear sampling.
fn align(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &ALIGNED_LANDMARKS);
    RgbImage::from_fn(EMB_INPUT_SIZE, EMB_INPUT_SIZE, |x, y| {
        let (sx, sy) = transform.invert_point(x as f32, y as f32);
        sample_bilinear(image, sx, sy)
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if x < 0.0 || y < 0.0 || x > w - 1.0 || y > h - 1.0 {
        return Rgb([0, 0, 0]);
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let mut out = [0u8; 3];
    for (c, v) in out.iter_mut().enumerate() {
        let p = |px: u32, py: u32| image.get_pixel(px, py)[c] as f32;
        let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
        let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
        *v = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn embedder_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = EMB_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, Rgb(px)) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - EMB_MEAN) / EMB_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
