//! Frame acquisition from the camera application's snapshot file.

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame not found: {0}")]
    NotFound(String),
    #[error("decode failed for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Anything that can hand the engine the latest RGB frame.
pub trait FrameSource {
    fn capture(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Reads whatever image currently sits at a fixed path.
pub struct SnapshotSource {
    path: PathBuf,
}

impl SnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for SnapshotSource {
    fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        load_image(&self.path)
    }
}

/// Decode any supported image file into RGB8.
pub fn load_image(path: &Path) -> Result<RgbImage, CaptureError> {
    if !path.exists() {
        return Err(CaptureError::NotFound(path.display().to_string()));
    }
    let image = image::open(path).map_err(|source| CaptureError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    Ok(image.to_rgb8())
}
