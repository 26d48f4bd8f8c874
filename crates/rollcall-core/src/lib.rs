//! rollcall-core: face embedding extraction, gallery training and matching.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both running via
//! ONNX Runtime on the CPU. Trained galleries are versioned on disk and served
//! to matchers as immutable snapshots.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod trainer;
pub mod types;

pub use config::{default_data_dir, default_model_dir, DetectorBackbone, EngineConfig};
pub use extractor::{EncodingExtractor, ExtractError, OnnxExtractor};
pub use gallery::{GalleryError, GalleryStore, ModelStats, TrainedModel};
pub use matcher::{Matcher, NearestMatcher};
pub use trainer::{EnrollmentImage, TrainError, TrainOutcome, Trainer, TrainingSummary};
pub use types::{BoundingBox, Embedding, FaceEmbedding, Identity, MatchResult, MatchVerdict};
