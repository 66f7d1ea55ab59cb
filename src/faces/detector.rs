use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db::BoundingBox;

/// A detected face with bounding box and raw (not yet normalized) embedding
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Finds faces in an upright image and embeds each one.
pub trait FaceDetector: Send {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// Builds a detector for one scan run. Failure here is fatal to the run.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceDetector>>;
}

const DETECTION_MODEL_FILE: &str = "ultraface-320.onnx";
const EMBEDDING_MODEL_FILE: &str = "arcface-resnet100.onnx";

/// Download a model file if it doesn't exist
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        // Written under a temporary name so an interrupted download is not
        // mistaken for a model on the next run.
        let partial = model_path.with_extension("onnx.part");
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

fn load_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;
    Ok(session)
}

/// UltraFace detection + ArcFace embedding through ONNX Runtime.
pub struct OnnxDetectorFactory {
    models_dir: PathBuf,
    detection_url: String,
    embedding_url: String,
    intra_threads: usize,
    confidence_threshold: f32,
}

impl OnnxDetectorFactory {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models_dir: config.models_dir(),
            detection_url: config.models.detection_url.clone(),
            embedding_url: config.models.embedding_url.clone(),
            intra_threads: config.models.intra_threads.max(1),
            confidence_threshold: config.models.detection_confidence,
        }
    }
}

impl DetectorFactory for OnnxDetectorFactory {
    fn create(&self) -> Result<Box<dyn FaceDetector>> {
        let detection_path =
            ensure_model(&self.models_dir, DETECTION_MODEL_FILE, &self.detection_url)?;
        let embedding_path =
            ensure_model(&self.models_dir, EMBEDDING_MODEL_FILE, &self.embedding_url)?;

        let detector = OnnxFaceDetector {
            detection: load_session(&detection_path, self.intra_threads)?,
            embedding: load_session(&embedding_path, self.intra_threads)?,
            confidence_threshold: self.confidence_threshold,
        };
        tracing::info!(models = ?self.models_dir, "Face models loaded");
        Ok(Box::new(detector))
    }
}

pub struct OnnxFaceDetector {
    detection: Session,
    embedding: Session,
    confidence_threshold: f32,
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let face_boxes = run_ultraface_detection(&mut self.detection, img, self.confidence_threshold)?;

        let mut detected_faces = Vec::with_capacity(face_boxes.len());
        for (bbox, confidence) in face_boxes {
            if bbox.area() <= 0.0 {
                continue;
            }

            let face_crop = crop_face(img, &bbox);
            let embedding = run_arcface_embedding(&mut self.embedding, &face_crop)?;

            detected_faces.push(DetectedFace {
                bbox,
                embedding,
                confidence,
            });
        }

        Ok(detected_faces)
    }
}

/// Run UltraFace detection model
fn run_ultraface_detection(
    session: &mut Session,
    img: &DynamicImage,
    confidence_threshold: f32,
) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: usize = 320;
    const INPUT_HEIGHT: usize = 240;
    const NMS_THRESHOLD: f32 = 0.3;
    const PLANE: usize = INPUT_WIDTH * INPUT_HEIGHT;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // NCHW, normalized to roughly [-1, 1]
    let mut input_data = vec![0.0f32; 3 * PLANE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[PLANE + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * PLANE + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT, INPUT_WIDTH],
        input_data.into_boxed_slice(),
    ))?;
    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape
        .get(1)
        .copied()
        .ok_or_else(|| anyhow!("Unexpected scores shape"))? as usize;
    let size = (orig_width as f32, orig_height as f32);

    let face_boxes = decode_detections(scores_data, boxes_data, num_anchors, size, confidence_threshold)?;
    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Boxes above `threshold`, scaled to an image of `(w, h)`. Fails when the
/// outputs hold fewer anchors than the scores shape claims.
fn decode_detections(
    scores: &[f32],
    boxes: &[f32],
    num_anchors: usize,
    (w, h): (f32, f32),
    threshold: f32,
) -> Result<Vec<(BoundingBox, f32)>> {
    let scores_needed = num_anchors.checked_mul(2);
    let boxes_needed = num_anchors.checked_mul(4);
    if scores_needed.map_or(true, |n| scores.len() < n) || boxes_needed.map_or(true, |n| boxes.len() < n) {
        bail!(
            "Detector output too short for {} anchors: {} scores, {} box values",
            num_anchors,
            scores.len(),
            boxes.len()
        );
    }

    let mut face_boxes = Vec::new();
    for (score, coords) in scores.chunks_exact(2).zip(boxes.chunks_exact(4)).take(num_anchors) {
        let confidence = score[1];
        if confidence <= threshold {
            continue;
        }

        let bbox = BoundingBox::new(
            (coords[0] * w).clamp(0.0, w),
            (coords[1] * h).clamp(0.0, h),
            (coords[2] * w).clamp(0.0, w),
            (coords[3] * h).clamp(0.0, h),
        );
        face_boxes.push((bbox, confidence));
    }

    Ok(face_boxes)
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for (bbox, confidence) in boxes {
        if keep.iter().all(|(kept, _)| compute_iou(kept, &bbox) <= threshold) {
            keep.push((bbox, confidence));
        }
    }
    keep
}

/// Intersection over Union of two boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap = BoundingBox::new(a.x1.max(b.x1), a.y1.max(b.y1), a.x2.min(b.x2), a.y2.min(b.y2));
    let intersection = overlap.area();
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop the face with 20% padding, clamped to the image
fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();
    let pad_x = bbox.width() * 0.2;
    let pad_y = bbox.height() * 0.2;

    let x = (bbox.x1 - pad_x).max(0.0) as u32;
    let y = (bbox.y1 - pad_y).max(0.0) as u32;
    let x = x.min(img_width.saturating_sub(1));
    let y = y.min(img_height.saturating_sub(1));
    let w = ((bbox.width() + pad_x * 2.0) as u32).min(img_width - x);
    let h = ((bbox.height() + pad_y * 2.0) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace embedding model
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: usize = 112;
    const PLANE: usize = INPUT_SIZE * INPUT_SIZE;

    let resized = face_img.resize_exact(
        INPUT_SIZE as u32,
        INPUT_SIZE as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let mut input_data = vec![0.0f32; 3 * PLANE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input_data[PLANE + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input_data[2 * PLANE + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE, INPUT_SIZE],
        input_data.into_boxed_slice(),
    ))?;

    // ArcFace ONNX model uses "data" as input name
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;
    let embedding_output = outputs.iter().next()
        .ok_or_else(|| anyhow!("No embedding output"))?;

    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;
    Ok(embedding_data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        let c = BoundingBox::new(20.0, 20.0, 30.0, 30.0);

        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((compute_iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(compute_iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let boxes = vec![
            (BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.8),
            (BoundingBox::new(1.0, 1.0, 11.0, 11.0), 0.95),
            (BoundingBox::new(50.0, 50.0, 60.0, 60.0), 0.75),
        ];

        let kept = nms(boxes, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.95);
        assert_eq!(kept[1].1, 0.75);
    }

    #[test]
    fn test_decode_scales_confident_anchors() {
        let scores = [0.9, 0.1, 0.2, 0.8];
        let boxes = [0.0, 0.0, 0.1, 0.1, 0.5, 0.25, 1.5, 0.75];

        let found = decode_detections(&scores, &boxes, 2, (200.0, 100.0), 0.7).unwrap();
        assert_eq!(found.len(), 1);
        let (bbox, confidence) = &found[0];
        assert_eq!(*confidence, 0.8);
        assert_eq!((bbox.x1, bbox.y1, bbox.x2, bbox.y2), (100.0, 25.0, 200.0, 75.0));
    }

    #[test]
    fn test_decode_rejects_short_outputs() {
        let scores = [0.1, 0.9, 0.1, 0.9];
        let boxes = [0.0, 0.0, 0.5, 0.5];

        assert!(decode_detections(&scores, &boxes, 2, (100.0, 100.0), 0.5).is_err());
        assert!(decode_detections(&scores[..2], &[0.0; 8], 2, (100.0, 100.0), 0.5).is_err());
        assert!(decode_detections(&[], &[], usize::MAX, (100.0, 100.0), 0.5).is_err());
    }

    #[test]
    fn test_crop_stays_inside_image() {
        let img = DynamicImage::new_rgb8(100, 80);
        let crop = crop_face(&img, &BoundingBox::new(90.0, 70.0, 100.0, 80.0));
        let (w, h) = crop.dimensions();
        assert!(w >= 1 && h >= 1);
        assert!(w <= 12 && h <= 12);
    }

    #[test]
    fn test_factory_reads_model_config() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/data/facegroup");
        config.models.intra_threads = 0;

        let factory = OnnxDetectorFactory::from_config(&config);
        assert_eq!(factory.models_dir, PathBuf::from("/data/facegroup/models"));
        assert_eq!(factory.intra_threads, 1);
    }
}
