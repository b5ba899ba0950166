//! Detector output post-processing.
//!
//! Turns raw `[cx, cy, w, h, confidence]` rows (normalized to the square model
//! input) into face boxes in original-image pixel space: confidence filter,
//! letterbox inversion, clamping, minimum-size gate, optional padding, greedy
//! NMS, and a final largest-first ordering.

use crate::types::FaceBox;
use std::cmp::Ordering;

/// Default square model input size (YOLOv8-face export).
pub const DEFAULT_INPUT_SIZE: usize = 960;
/// Confidence floor used while an operator supervises enrollment.
pub const ENROLL_CONFIDENCE_THRESHOLD: f32 = 0.50;
/// Confidence floor for unattended verification.
pub const VERIFY_CONFIDENCE_THRESHOLD: f32 = 0.75;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
/// Faces smaller than this (pixels, either side) are too far away to embed.
pub const DEFAULT_MIN_BOX_SIZE: f32 = 80.0;
pub const DEFAULT_PADDING: f32 = 0.20;

/// Resize-and-pad transform that fit the image into the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Compute the transform for an `img_w × img_h` image and square input `size`.
    ///
    /// Scaled dimensions are rounded and padding is floored, matching the
    /// pixel placement done by the detector's preprocessing.
    pub fn fit(img_w: u32, img_h: u32, size: usize) -> Self {
        let s = size as f32;
        let scale = (s / img_w as f32).min(s / img_h as f32);
        let (new_w, new_h) = Self::scaled(img_w, img_h, scale);
        Self {
            scale,
            pad_x: (size.saturating_sub(new_w) / 2) as f32,
            pad_y: (size.saturating_sub(new_h) / 2) as f32,
        }
    }

    /// Size of the image after scaling, before padding.
    pub fn scaled(img_w: u32, img_h: u32, scale: f32) -> (usize, usize) {
        (
            (img_w as f32 * scale).round() as usize,
            (img_h as f32 * scale).round() as usize,
        )
    }
}

/// One raw detector row, all fields relative to the model input (0–1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

impl From<[f32; 5]> for RawBox {
    fn from(v: [f32; 5]) -> Self {
        Self {
            cx: v[0],
            cy: v[1],
            w: v[2],
            h: v[3],
            confidence: v[4],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostprocessConfig {
    /// Square model input size S.
    pub input_size: usize,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub min_box_size: f32,
    /// Fraction of the box size added around it (half on each side); 0 disables.
    pub padding: f32,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: VERIFY_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            min_box_size: DEFAULT_MIN_BOX_SIZE,
            padding: DEFAULT_PADDING,
        }
    }
}

impl PostprocessConfig {
    pub fn with_confidence(&self, confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
            ..self.clone()
        }
    }
}

/// Run the full post-processing chain over one detector invocation.
pub fn postprocess(
    raw: &[RawBox],
    img_w: u32,
    img_h: u32,
    letterbox: &Letterbox,
    config: &PostprocessConfig,
) -> Vec<FaceBox> {
    let s = config.input_size as f32;
    let (img_w, img_h) = (img_w as f32, img_h as f32);

    let candidates: Vec<FaceBox> = raw
        .iter()
        .filter(|r| r.confidence.is_finite() && r.confidence >= config.confidence_threshold)
        .filter_map(|r| {
            let w = r.w * s / letterbox.scale;
            let h = r.h * s / letterbox.scale;
            let x = (r.cx * s - r.w * s / 2.0 - letterbox.pad_x) / letterbox.scale;
            let y = (r.cy * s - r.h * s / 2.0 - letterbox.pad_y) / letterbox.scale;

            let clamped = clamp_box(x, y, w, h, r.confidence, img_w, img_h, config.min_box_size)?;
            if config.padding > 0.0 {
                pad_box(&clamped, config.padding, img_w, img_h, config.min_box_size)
            } else {
                Some(clamped)
            }
        })
        .collect();

    let before = candidates.len();
    let mut kept = nms(candidates, config.iou_threshold);
    sort_by_area(&mut kept);

    tracing::trace!(
        raw = raw.len(),
        candidates = before,
        kept = kept.len(),
        "postprocessed detections"
    );

    kept
}

/// Clamp to `[0, img_w] × [0, img_h]` and drop boxes below `min_size`.
#[allow(clippy::too_many_arguments)]
fn clamp_box(
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    confidence: f32,
    img_w: f32,
    img_h: f32,
    min_size: f32,
) -> Option<FaceBox> {
    if !(x.is_finite() && y.is_finite() && w.is_finite() && h.is_finite()) {
        return None;
    }
    let x0 = x.max(0.0);
    let y0 = y.max(0.0);
    let x1 = (x + w).min(img_w);
    let y1 = (y + h).min(img_h);
    let width = x1 - x0;
    let height = y1 - y0;

    if width <= 0.0 || height <= 0.0 || width < min_size || height < min_size {
        return None;
    }

    Some(FaceBox {
        x: x0,
        y: y0,
        width,
        height,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

/// Grow a box by `fraction` of its size (half per side), then re-clamp.
fn pad_box(b: &FaceBox, fraction: f32, img_w: f32, img_h: f32, min_size: f32) -> Option<FaceBox> {
    let dx = b.width * fraction / 2.0;
    let dy = b.height * fraction / 2.0;
    clamp_box(
        b.x - dx,
        b.y - dy,
        b.width + 2.0 * dx,
        b.height + 2.0 * dy,
        b.confidence,
        img_w,
        img_h,
        min_size,
    )
}

fn by_confidence_desc(a: &FaceBox, b: &FaceBox) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
}

/// Largest area first, ties broken by confidence.
pub fn sort_by_area(boxes: &mut [FaceBox]) {
    boxes.sort_by(|a, b| {
        b.area()
            .partial_cmp(&a.area())
            .unwrap_or(Ordering::Equal)
            .then_with(|| by_confidence_desc(a, b))
    });
}

/// Greedy Non-Maximum Suppression.
///
/// Boxes overlapping an already kept, higher-confidence box with
/// IoU ≥ `iou_threshold` are discarded.
pub fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    detections.sort_by(by_confidence_desc);

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union of two boxes; 0 when the union is empty.
pub fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
