//! Image → face embeddings.
//!
//! The [`EncodingExtractor`] trait is the seam the trainer and the live
//! recognition loop depend on; [`OnnxExtractor`] is the production
//! implementation built from the SCRFD detector and ArcFace recognizer.

use crate::config::DetectorBackbone;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceEmbedding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("detector backbone '{0}' is not loaded")]
    BackboneUnavailable(DetectorBackbone),
    #[error("unreadable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Produces one embedding per detected face, in detection order.
///
/// An image with no faces yields an empty vector; that is a normal outcome.
pub trait EncodingExtractor: Send {
    fn extract(
        &mut self,
        image: &GrayImage,
        backbone: DetectorBackbone,
    ) -> Result<Vec<FaceEmbedding>, ExtractError>;
}

/// Decode an image file into the grayscale buffer the pipeline works on.
pub fn load_gray(path: &Path) -> Result<GrayImage, ExtractError> {
    Ok(image::open(path)?.into_luma8())
}

/// Shrink `image` so its longer side is at most `max_dimension`.
///
/// Returns the (possibly borrowed) image and the factor that maps
/// coordinates on it back to the original.
pub fn downscale(image: &GrayImage, max_dimension: u32) -> (Cow<'_, GrayImage>, f32) {
    let longest = image.width().max(image.height());
    if longest <= max_dimension || longest == 0 {
        return (Cow::Borrowed(image), 1.0);
    }
    let scale = max_dimension as f32 / longest as f32;
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    tracing::debug!(from = ?image.dimensions(), to = ?(w, h), "downscaling before detection");
    let resized = imageops::resize(image, w, h, FilterType::Triangle);
    (Cow::Owned(resized), image.width() as f32 / w as f32)
}

/// SCRFD + ArcFace extractor with one or both detector backbones loaded.
pub struct OnnxExtractor {
    detectors: HashMap<DetectorBackbone, FaceDetector>,
    recognizer: FaceRecognizer,
    max_image_dimension: u32,
}

impl OnnxExtractor {
    /// Load the recognizer and each requested backbone from `model_dir`.
    pub fn load(
        model_dir: &Path,
        backbones: &[DetectorBackbone],
        max_image_dimension: u32,
    ) -> Result<Self, ExtractError> {
        let mut detectors = HashMap::new();
        for &backbone in backbones {
            detectors.insert(backbone, FaceDetector::load(model_dir, backbone)?);
        }
        let recognizer = FaceRecognizer::load(model_dir)?;
        Ok(Self {
            detectors,
            recognizer,
            max_image_dimension,
        })
    }
}

impl EncodingExtractor for OnnxExtractor {
    fn extract(
        &mut self,
        image: &GrayImage,
        backbone: DetectorBackbone,
    ) -> Result<Vec<FaceEmbedding>, ExtractError> {
        let detector = self
            .detectors
            .get_mut(&backbone)
            .ok_or(ExtractError::BackboneUnavailable(backbone))?;

        let (working, back) = downscale(image, self.max_image_dimension);
        let faces = detector.detect(&working)?;
        if faces.is_empty() {
            tracing::debug!(%backbone, "no face detected");
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(faces.len());
        for face in &faces {
            let embedding = self.recognizer.embed(&working, face)?;
            out.push(FaceEmbedding {
                embedding,
                bbox: face.rescaled(back),
            });
        }
        tracing::debug!(%backbone, faces = out.len(), "extracted embeddings");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_downscale_leaves_small_images_alone() {
        let image = GrayImage::from_pixel(640, 480, Luma([10]));
        let (out, back) = downscale(&image, 1024);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(back, 1.0);
    }

    #[test]
    fn test_downscale_bounds_longest_side() {
        let image = GrayImage::from_pixel(4096, 2048, Luma([10]));
        let (out, back) = downscale(&image, 1024);
        assert_eq!(out.dimensions(), (1024, 512));
        assert!((back - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_gray_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(load_gray(&path), Err(ExtractError::Image(_))));
    }
}
