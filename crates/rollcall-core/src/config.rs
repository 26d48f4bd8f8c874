//! Engine configuration shared by the trainer and matcher.
//!
//! Constructed once by the caller and passed by value. Only the default
//! data directory looks at the environment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;
pub const DEFAULT_TIE_EPSILON: f32 = 0.02;
pub const DEFAULT_MIN_IMAGES_PER_IDENTITY: usize = 3;
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 1024;
pub const DEFAULT_RETAIN_VERSIONS: usize = 5;
/// Rollback needs at least the current and the previous snapshot on disk.
pub const MIN_RETAIN_VERSIONS: usize = 2;

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Where the SCRFD and ArcFace ONNX files are expected by default.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Face detector backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackbone {
    /// SCRFD-500M at 320×320, CPU real-time, used for live recognition.
    Fast,
    /// SCRFD-10G at 640×640, slower, used for enrollment.
    Accurate,
}

impl DetectorBackbone {
    /// ONNX file name expected in the model directory.
    pub fn model_file(self) -> &'static str {
        match self {
            DetectorBackbone::Fast => "scrfd_500m_bnkps.onnx",
            DetectorBackbone::Accurate => "det_10g.onnx",
        }
    }

    /// Square network input size in pixels.
    pub fn input_size(self) -> usize {
        match self {
            DetectorBackbone::Fast => 320,
            DetectorBackbone::Accurate => 640,
        }
    }
}

impl fmt::Display for DetectorBackbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorBackbone::Fast => f.write_str("fast"),
            DetectorBackbone::Accurate => f.write_str("accurate"),
        }
    }
}

impl FromStr for DetectorBackbone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectorBackbone::Fast),
            "accurate" | "cnn" => Ok(DetectorBackbone::Accurate),
            other => Err(format!("unknown detector backbone '{other}' (expected fast|accurate)")),
        }
    }
}

/// Tunables for extraction, training and matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backbone used when the caller does not pick one.
    pub detector_backbone: DetectorBackbone,
    /// Minimum confidence for a match to be accepted (inclusive).
    pub confidence_threshold: f32,
    /// Two identities closer than this in confidence are reported as unknown.
    pub tie_epsilon: f32,
    /// Valid embeddings an identity needs before it enters the gallery.
    pub min_images_per_identity: usize,
    /// Images with a longer side than this are downscaled before detection.
    pub max_image_dimension: u32,
    /// Gallery versions kept on disk for rollback.
    pub retain_versions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detector_backbone: DetectorBackbone::Fast,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            tie_epsilon: DEFAULT_TIE_EPSILON,
            min_images_per_identity: DEFAULT_MIN_IMAGES_PER_IDENTITY,
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
            retain_versions: DEFAULT_RETAIN_VERSIONS,
        }
    }
}

impl EngineConfig {
    /// Clamp values into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.tie_epsilon = self.tie_epsilon.max(0.0);
        self.min_images_per_identity = self.min_images_per_identity.max(1);
        self.max_image_dimension = self.max_image_dimension.max(64);
        self.retain_versions = self.retain_versions.max(MIN_RETAIN_VERSIONS);
        self
    }
}
