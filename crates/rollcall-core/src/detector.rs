//! YOLOv8-face detector via ONNX Runtime.
//!
//! Letterboxes the RGB frame onto a black square canvas, runs a single-output
//! model emitting `[1, 5, N]` rows of `(cx, cy, w, h, confidence)` relative to
//! the input square, and hands the rows to [`crate::postprocess`].

use crate::postprocess::{self, Letterbox, PostprocessConfig, RawBox};
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const YOLO_CHANNELS: usize = 5;
const YOLO_PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("empty frame ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detector seam. An empty result means "no face", not an error.
pub trait Detector {
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<FaceBox>, DetectorError>;
}

pub struct YoloFaceDetector {
    session: Session,
    config: PostprocessConfig,
}

impl YoloFaceDetector {
    /// Load the YOLOv8-face ONNX model from the given path.
    pub fn load(model_path: &str, config: PostprocessConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size = config.input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded YOLO face model"
        );

        Ok(Self { session, config })
    }
}

impl Detector for YoloFaceDetector {
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyFrame { width, height });
        }

        let (input, letterbox) = preprocess(image, self.config.input_size);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;
        let raw = parse_output(data)?;

        let config = self.config.with_confidence(confidence_threshold);
        Ok(postprocess::postprocess(&raw, width, height, &letterbox, &config))
    }
}

/// Letterbox an RGB frame into a `1×3×S×S` tensor scaled to [0, 1].
///
/// The scaled image sits at the floored padding offset on a black canvas, so
/// [`Letterbox::fit`] describes exactly what was done here.
pub fn preprocess(image: &RgbImage, size: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let letterbox = Letterbox::fit(width, height, size);
    let (new_w, new_h) = Letterbox::scaled(width, height, letterbox.scale);

    let resized = imageops::resize(
        image,
        new_w.clamp(1, size) as u32,
        new_h.clamp(1, size) as u32,
        FilterType::Triangle,
    );
    let mut canvas = RgbImage::new(size as u32, size as u32);
    imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = pixel[c] as f32 / YOLO_PIXEL_SCALE;
        }
    }

    (tensor, letterbox)
}

/// Split a channel-major `[1, 5, N]` buffer into rows.
fn parse_output(data: &[f32]) -> Result<Vec<RawBox>, DetectorError> {
    if data.len() % YOLO_CHANNELS != 0 {
        return Err(DetectorError::InferenceFailed(format!(
            "output length {} is not a multiple of {YOLO_CHANNELS}",
            data.len()
        )));
    }
    let n = data.len() / YOLO_CHANNELS;
    Ok((0..n)
        .map(|i| RawBox::from(std::array::from_fn(|c| data[c * n + i])))
        .collect())
}
