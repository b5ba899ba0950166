//! MobileFaceNet embedder via ONNX Runtime.
//!
//! Produces raw (not yet normalized) face embeddings from face crops. The crop
//! is padded to a centered square before resizing so faces keep their aspect.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const FACENET_INPUT_SIZE: usize = 112;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
pub const DEFAULT_EMBEDDING_DIM: usize = 192;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding model seam: face crop in, raw vector out.
pub trait Embedder {
    fn embed(&mut self, face_crop: &RgbImage) -> Result<Vec<f32>, RecognizerError>;
}

pub struct FaceNetEmbedder {
    session: Session,
    dim: usize,
}

impl FaceNetEmbedder {
    /// Load the embedding model; `dim` is the vector length it must produce.
    pub fn load(model_path: &str, dim: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            dim,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded MobileFaceNet model"
        );

        Ok(Self { session, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Embedder for FaceNetEmbedder {
    fn embed(&mut self, face_crop: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        if face_crop.width() == 0 || face_crop.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let input = preprocess(face_crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.dim {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.dim,
                raw.len()
            )));
        }

        Ok(raw.to_vec())
    }
}

/// Square-pad, resize to 112×112 and normalize into a NCHW tensor.
pub fn preprocess(face_crop: &RgbImage) -> Array4<f32> {
    let squared = pad_to_square(face_crop);
    let size = FACENET_INPUT_SIZE;
    let resized = imageops::resize(&squared, size as u32, size as u32, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - FACENET_MEAN) / FACENET_STD;
        }
    }
    tensor
}

/// Center the crop on a black square whose side is its longer edge.
fn pad_to_square(crop: &RgbImage) -> RgbImage {
    let (w, h) = crop.dimensions();
    if w == h {
        return crop.clone();
    }
    let side = w.max(h);
    let mut canvas = RgbImage::new(side, side);
    imageops::replace(
        &mut canvas,
        crop,
        ((side - w) / 2) as i64,
        ((side - h) / 2) as i64,
    );
    canvas
}

/// Cut a detected face out of the frame. `None` if the box covers no pixels.
pub fn crop_face(frame: &RgbImage, face: &FaceBox) -> Option<RgbImage> {
    let (fw, fh) = frame.dimensions();
    let x0 = (face.x.max(0.0).floor() as u32).min(fw);
    let y0 = (face.y.max(0.0).floor() as u32).min(fh);
    let x1 = (face.right().ceil().max(0.0) as u32).min(fw);
    let y1 = (face.bottom().ceil().max(0.0) as u32).min(fh);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(imageops::crop_imm(frame, x0, y0, x1 - x0, y1 - y0).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(90, 120, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = preprocess(&crop);
        assert!((tensor[[0, 0, 56, 56]] - (255.0 - 127.5) / 128.0).abs() < 1e-5);
        assert!((tensor[[0, 1, 56, 56]] - (0.0 - 127.5) / 128.0).abs() < 1e-5);
        assert!((tensor[[0, 2, 56, 56]] - (128.0 - 127.5) / 128.0).abs() < 1e-5);
    }

    #[test]
    fn test_pad_to_square_centers_crop() {
        let crop = RgbImage::from_pixel(40, 100, Rgb([255, 255, 255]));
        let squared = pad_to_square(&crop);
        assert_eq!(squared.dimensions(), (100, 100));
        assert_eq!(squared.get_pixel(10, 50), &Rgb([0, 0, 0]));
        assert_eq!(squared.get_pixel(50, 50), &Rgb([255, 255, 255]));
        assert_eq!(squared.get_pixel(89, 50), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_crop_face_within_bounds() {
        let frame = RgbImage::new(200, 100);
        let face = FaceBox { x: 150.5, y: 20.0, width: 80.0, height: 50.0, confidence: 0.9 };
        let crop = crop_face(&frame, &face).unwrap();
        assert_eq!(crop.dimensions(), (50, 50));
    }

    #[test]
    fn test_crop_face_outside_frame() {
        let frame = RgbImage::new(100, 100);
        let face = FaceBox { x: 120.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 };
        assert!(crop_face(&frame, &face).is_none());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceNetEmbedder::load("/nonexistent/mobilefacenet.onnx", DEFAULT_EMBEDDING_DIM);
        assert!(matches!(err, Err(RecognizerError::ModelNotFound(_))));
    }
}
