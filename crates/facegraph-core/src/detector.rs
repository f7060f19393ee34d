//! SCRFD face locator via ONNX Runtime.
//!
//! Anchor-free decoding over three stride levels with NMS post-processing.
//! Detection runs once per image; a cascade of per-stride confidence
//! threshold triples is then applied to the raw outputs in order, stopping
//! at the first setting that yields any face. Among the survivors the
//! largest box wins, on the assumption that the subject of an enrollment
//! or identification photo is the dominant face in frame.

use crate::types::BoundingBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: usize = 640;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Per-stride confidence floors, one per stride [8, 16, 32].
pub type ThresholdTriple = [f32; 3];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download an SCRFD export and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection tunables. The exact numeric defaults are hand-tuned, not
/// load-bearing correctness constraints.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Threshold triples tried in order until one yields a detection.
    pub cascade: Vec<ThresholdTriple>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cascade: vec![
                [0.6, 0.7, 0.7],
                [0.5, 0.6, 0.6],
                [0.4, 0.5, 0.5],
                [0.3, 0.4, 0.4],
            ],
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Raw per-stride model outputs, decoupled from the session so the
/// threshold cascade can be re-applied without re-running inference.
struct StrideOutputs {
    scores: [Vec<f32>; 3],
    bboxes: [Vec<f32>; 3],
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Strategy seam for face location, letting the pipeline be exercised
/// without a loaded model.
pub trait LocateFaces: Send + Sync {
    /// Locate the dominant face, or `None` — a valid outcome, not an error.
    fn locate(&self, image: &RgbImage) -> Result<Option<BoundingBox>, DetectorError>;
}

/// SCRFD-based face locator.
pub struct FaceDetector {
    session: Mutex<Session>,
    config: DetectorConfig,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            cascade_settings = config.cascade.len(),
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            config,
            stride_indices,
        })
    }

    fn run_inference(&self, input: Array4<f32>) -> Result<StrideOutputs, DetectorError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("session mutex poisoned".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut scores: [Vec<f32>; 3] = Default::default();
        let mut bboxes: [Vec<f32>; 3] = Default::default();

        for (stride_pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, score_data) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bbox_data) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            scores[stride_pos] = score_data.to_vec();
            bboxes[stride_pos] = bbox_data.to_vec();
        }

        Ok(StrideOutputs { scores, bboxes })
    }
}

impl LocateFaces for FaceDetector {
    fn locate(&self, image: &RgbImage) -> Result<Option<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let raw = self.run_inference(input)?;

        let (width, height) = image.dimensions();
        let face = cascade_select(&raw, &self.config.cascade, &letterbox, width, height);

        match &face {
            Some(b) => tracing::debug!(
                confidence = b.confidence,
                area = b.area(),
                "face located"
            ),
            None => tracing::debug!("no face found at any cascade setting"),
        }

        Ok(face)
    }
}

/// Letterbox an RGB image into a 640×640 NCHW float tensor.
///
/// BGR channel order, (v − 127.5)/128 normalization, padding filled with
/// the mean so padded pixels normalize to zero.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let size = DETECTOR_INPUT_SIZE as u32;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).max(1);
    let new_h = ((height as f32 * scale).round() as u32).max(1);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(image, new_w, new_h, image::imageops::FilterType::Triangle);

    let pad_x_start = pad_x.floor() as u32;
    let pad_y_start = pad_y.floor() as u32;

    let mut tensor = Array4::<f32>::from_elem((1, 3, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE), 0.0);

    for y in 0..size {
        for x in 0..size {
            let inside = y >= pad_y_start
                && y < pad_y_start + new_h
                && x >= pad_x_start
                && x < pad_x_start + new_w;
            let [r, g, b] = if inside {
                resized.get_pixel(x - pad_x_start, y - pad_y_start).0
            } else {
                // Pad value normalizes to 0.0
                [DETECTOR_MEAN as u8; 3]
            };

            // InsightFace exports expect BGR channel order
            tensor[[0, 0, y as usize, x as usize]] = (b as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            tensor[[0, 1, y as usize, x as usize]] = (g as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            tensor[[0, 2, y as usize, x as usize]] = (r as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Apply the threshold cascade to raw outputs, most trusted setting first,
/// and pick the largest surviving box of the first setting that detects
/// anything. Ties go to the first-seen box.
fn cascade_select(
    raw: &StrideOutputs,
    cascade: &[ThresholdTriple],
    letterbox: &LetterboxInfo,
    img_width: u32,
    img_height: u32,
) -> Option<BoundingBox> {
    for thresholds in cascade {
        let mut detections = Vec::new();
        for (stride_pos, &stride) in STRIDES.iter().enumerate() {
            detections.extend(decode_stride(
                &raw.scores[stride_pos],
                &raw.bboxes[stride_pos],
                stride,
                thresholds[stride_pos],
                letterbox,
                img_width,
                img_height,
            ));
        }

        if detections.is_empty() {
            continue;
        }

        let kept = nms(detections, NMS_IOU_THRESHOLD);
        if let Some(best) = largest_box(&kept) {
            return Some(best);
        }
    }

    None
}

/// Decode detections for a single stride level, mapping coordinates back
/// from letterboxed space and clamping to image bounds.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    threshold: f32,
    letterbox: &LetterboxInfo,
    img_width: u32,
    img_height: u32,
) -> Vec<BoundingBox> {
    let grid_w = DETECTOR_INPUT_SIZE / stride;
    let grid_h = DETECTOR_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / ANCHORS_PER_CELL;
        let anchor_cx = ((anchor_idx % grid_w) * stride) as f32;
        let anchor_cy = ((anchor_idx / grid_w) * stride) as f32;

        // Decode bbox: [left, top, right, bottom] offsets × stride
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        // Map from letterboxed space to original image space
        let orig_x1 = ((x1 - letterbox.pad_x) / letterbox.scale).clamp(0.0, img_width as f32);
        let orig_y1 = ((y1 - letterbox.pad_y) / letterbox.scale).clamp(0.0, img_height as f32);
        let orig_x2 = ((x2 - letterbox.pad_x) / letterbox.scale).clamp(0.0, img_width as f32);
        let orig_y2 = ((y2 - letterbox.pad_y) / letterbox.scale).clamp(0.0, img_height as f32);

        if orig_x2 <= orig_x1 || orig_y2 <= orig_y1 {
            continue;
        }

        detections.push(BoundingBox {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            confidence: score,
        });
    }

    detections
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports may name tensors "score_8"/"bbox_8"/… or use generic
/// numeric names. Falls back to the standard positional ordering
/// ([0-2] = scores, [3-5] = bboxes for strides 8/16/32).
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = STRIDES
        .iter()
        .all(|&stride| find("score", stride).is_some() && find("bbox", stride).is_some());

    if named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        std::array::from_fn(|i| {
            let stride = STRIDES[i];
            // Presence checked above
            (find("score", stride).unwrap(), find("bbox", stride).unwrap())
        })
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Select the maximum-area box; the first-seen box wins ties.
fn largest_box(detections: &[BoundingBox]) -> Option<BoundingBox> {
    let mut best: Option<&BoundingBox> = None;
    for det in detections {
        match best {
            Some(b) if det.area() <= b.area() => {}
            _ => best = Some(det),
        }
    }
    best.cloned()
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    /// Raw outputs with a single anchor above `score` at stride 8, cell (4, 4).
    fn synthetic_outputs(score: f32, box_halfwidth: f32) -> StrideOutputs {
        let grid = DETECTOR_INPUT_SIZE / 8;
        let n = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; n];
        let mut bboxes = vec![0.0f32; n * 4];

        let idx = (4 * grid + 4) * ANCHORS_PER_CELL;
        scores[idx] = score;
        for k in 0..4 {
            bboxes[idx * 4 + k] = box_halfwidth / 8.0;
        }

        StrideOutputs {
            scores: [scores, vec![], vec![]],
            bboxes: [bboxes, vec![], vec![]],
        }
    }

    fn identity_letterbox() -> LetterboxInfo {
        LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_largest_box_prefers_area_over_confidence() {
        let boxes = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.99),
            make_bbox(50.0, 50.0, 80.0, 80.0, 0.6),
        ];
        let best = largest_box(&boxes).unwrap();
        assert!((best.width - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_largest_box_tie_keeps_first_seen() {
        let boxes = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.5),
            make_bbox(99.0, 99.0, 10.0, 10.0, 0.9),
        ];
        let best = largest_box(&boxes).unwrap();
        assert!((best.x - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_largest_box_empty() {
        assert!(largest_box(&[]).is_none());
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let raw = synthetic_outputs(0.45, 16.0);
        let lb = identity_letterbox();
        assert!(decode_stride(&raw.scores[0], &raw.bboxes[0], 8, 0.5, &lb, 640, 640).is_empty());
        assert_eq!(decode_stride(&raw.scores[0], &raw.bboxes[0], 8, 0.4, &lb, 640, 640).len(), 1);
    }

    #[test]
    fn test_decode_stride_box_geometry() {
        let raw = synthetic_outputs(0.9, 16.0);
        let lb = identity_letterbox();
        let boxes = decode_stride(&raw.scores[0], &raw.bboxes[0], 8, 0.5, &lb, 640, 640);
        let b = &boxes[0];
        // Anchor center at (32, 32), half-width 16 → box (16, 16)–(48, 48)
        assert!((b.x - 16.0).abs() < 1e-4);
        assert!((b.y - 16.0).abs() < 1e-4);
        assert!((b.width - 32.0).abs() < 1e-4);
        assert!((b.height - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_cascade_falls_through_to_permissive_setting() {
        // Score 0.35 only passes the most permissive triple.
        let raw = synthetic_outputs(0.35, 16.0);
        let cascade = DetectorConfig::default().cascade;
        let found = cascade_select(&raw, &cascade, &identity_letterbox(), 640, 640);
        assert!(found.is_some());
        assert!((found.unwrap().confidence - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_cascade_exhausted_returns_none() {
        let raw = synthetic_outputs(0.1, 16.0);
        let cascade = DetectorConfig::default().cascade;
        assert!(cascade_select(&raw, &cascade, &identity_letterbox(), 640, 640).is_none());
    }

    #[test]
    fn test_cascade_first_setting_wins() {
        let raw = synthetic_outputs(0.95, 16.0);
        let cascade = DetectorConfig::default().cascade;
        let found = cascade_select(&raw, &cascade, &identity_letterbox(), 640, 640).unwrap();
        assert!((found.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8", "bbox_16", "bbox_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_shape_and_letterbox() {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([128, 128, 128]));
        let (tensor, lb) = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!(lb.pad_x.abs() < 1e-6);
        assert!((lb.pad_y - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_pad_normalizes_to_zero() {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([0, 0, 0]));
        let (tensor, _) = preprocess(&img);
        // Top rows are padding → exactly the mean → 0.0 after normalization
        assert!(tensor[[0, 0, 0, 0]].abs() < 1e-3);
    }
}
