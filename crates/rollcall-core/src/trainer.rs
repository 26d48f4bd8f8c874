//! Gallery training from per-identity enrollment images.
//!
//! Every image must contain exactly one face. Images that do not are
//! skipped and reported, never fatal. An identity enters the gallery only
//! once it has `min_images_per_identity` usable embeddings, and a failed
//! identity never leaves a partial entry behind.

use crate::config::{DetectorBackbone, EngineConfig};
use crate::extractor::{self, EncodingExtractor};
use crate::gallery::{GalleryError, GalleryStore, TrainedModel};
use crate::types::FaceEmbedding;
use image::GrayImage;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// File extensions picked up by folder-based enrollment.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
    #[error("enrollment directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One enrollment image as handed over by the student-management side.
pub enum EnrollmentImage {
    Decoded { label: String, image: GrayImage },
    Unreadable { label: String, error: String },
}

impl EnrollmentImage {
    pub fn decoded(label: impl Into<String>, image: GrayImage) -> Self {
        Self::Decoded { label: label.into(), image }
    }

    /// Decode `path`, keeping a decode failure as an `Unreadable` entry.
    pub fn from_path(path: &Path) -> Self {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match extractor::load_gray(path) {
            Ok(image) => Self::Decoded { label, image },
            Err(e) => Self::Unreadable { label, error: e.to_string() },
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Decoded { label, .. } | Self::Unreadable { label, .. } => label,
        }
    }
}

/// Why an enrollment image contributed nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    NoFace,
    MultipleFaces { count: usize },
    Unreadable { error: String },
    ExtractionFailed { error: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFace => f.write_str("no face detected"),
            SkipReason::MultipleFaces { count } => write!(f, "{count} faces detected, expected exactly one"),
            SkipReason::Unreadable { error } => write!(f, "image unreadable: {error}"),
            SkipReason::ExtractionFailed { error } => write!(f, "extraction failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedImage {
    pub identity: String,
    pub index: usize,
    pub label: String,
    pub reason: SkipReason,
}

/// Result of training one identity.
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub ok: bool,
    pub message: String,
    #[serde(skip)]
    pub embeddings: Vec<FaceEmbedding>,
    pub skipped: Vec<SkippedImage>,
    /// Gallery version published for this call, if any.
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainedPerson {
    pub identity: String,
    pub encodings: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPerson {
    pub identity: String,
    pub message: String,
}

/// Result of a full rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub success: bool,
    pub total_persons: usize,
    pub trained_count: usize,
    pub failed_count: usize,
    pub total_encodings: usize,
    pub trained: Vec<TrainedPerson>,
    pub failed: Vec<FailedPerson>,
    pub skipped: Vec<SkippedImage>,
    pub version: Option<u64>,
    pub message: String,
}

/// Embeddings gathered for one identity before the min-count check.
struct Collected {
    embeddings: Vec<FaceEmbedding>,
    skipped: Vec<SkippedImage>,
    submitted: usize,
}

/// Builds and publishes gallery versions.
pub struct Trainer<E> {
    extractor: E,
    config: EngineConfig,
    backbone: DetectorBackbone,
    store: Arc<GalleryStore>,
}

impl<E: EncodingExtractor> Trainer<E> {
    /// Enrollment defaults to the accurate backbone; override with
    /// [`with_backbone`](Self::with_backbone).
    pub fn new(extractor: E, config: EngineConfig, store: Arc<GalleryStore>) -> Self {
        Self {
            extractor,
            config: config.sanitized(),
            backbone: DetectorBackbone::Accurate,
            store,
        }
    }

    pub fn with_backbone(mut self, backbone: DetectorBackbone) -> Self {
        self.backbone = backbone;
        self
    }

    /// Train (or retrain) one identity on top of the serving gallery.
    ///
    /// On failure the gallery is left untouched and `ok` is false.
    pub fn train(&mut self, identity: &str, images: &[EnrollmentImage]) -> Result<TrainOutcome, TrainError> {
        let collected = self.collect(identity, images);
        if let Err(message) = self.check_trainable(identity, &collected) {
            tracing::warn!(identity, %message, "identity not trainable");
            return Ok(TrainOutcome {
                ok: false,
                message,
                embeddings: Vec::new(),
                skipped: collected.skipped,
                version: None,
            });
        }

        let message = success_message(identity, &collected);
        let embeddings = collected.embeddings;
        let published = self.store.update(|serving| {
            serving.with_identity(identity, embeddings.clone(), collected.submitted)
        })?;
        tracing::info!(identity, version = published.version, %message, "identity trained");

        Ok(TrainOutcome {
            ok: true,
            message,
            embeddings,
            skipped: collected.skipped,
            version: Some(published.version),
        })
    }

    /// Rebuild the gallery from scratch. One identity failing never stops the others.
    pub fn train_all(
        &mut self,
        identities: Vec<(String, Vec<EnrollmentImage>)>,
    ) -> Result<TrainingSummary, TrainError> {
        tracing::info!(
            persons = identities.len(),
            backbone = %self.backbone,
            min_images = self.config.min_images_per_identity,
            "starting gallery training"
        );

        let total_persons = identities.len();
        let mut model = TrainedModel::empty();
        let mut trained = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        for (n, (identity, images)) in identities.into_iter().enumerate() {
            tracing::debug!(identity = %identity, index = n + 1, of = total_persons, "training identity");
            let collected = self.collect(&identity, &images);
            skipped.extend(collected.skipped.iter().cloned());

            match self.check_trainable(&identity, &collected) {
                Ok(()) => {
                    let message = success_message(&identity, &collected);
                    tracing::info!(identity = %identity, %message, "identity trained");
                    trained.push(TrainedPerson {
                        identity: identity.clone(),
                        encodings: collected.embeddings.len(),
                        message,
                    });
                    model.insert(&identity, collected.embeddings, collected.submitted);
                }
                Err(message) => {
                    tracing::warn!(identity = %identity, %message, "identity not trainable");
                    failed.push(FailedPerson { identity, message });
                }
            }
        }

        let version = if trained.is_empty() {
            None
        } else {
            Some(self.store.publish(&model)?.version)
        };

        let summary = TrainingSummary {
            success: !trained.is_empty(),
            total_persons,
            trained_count: trained.len(),
            failed_count: failed.len(),
            total_encodings: model.total_encodings(),
            message: format!(
                "Training completed: {}/{} persons trained successfully",
                trained.len(),
                total_persons
            ),
            trained,
            failed,
            skipped,
            version,
        };
        tracing::info!(
            total_persons = summary.total_persons,
            trained = summary.trained_count,
            failed = summary.failed_count,
            encodings = summary.total_encodings,
            version = ?summary.version,
            "training summary"
        );
        Ok(summary)
    }

    /// Rebuild from a directory with one sub-directory of images per identity.
    pub fn train_directory(&mut self, root: &Path) -> Result<TrainingSummary, TrainError> {
        let identities = load_enrollment_dir(root)?;
        self.train_all(identities)
    }

    fn collect(&mut self, identity: &str, images: &[EnrollmentImage]) -> Collected {
        let mut embeddings = Vec::new();
        let mut skipped = Vec::new();

        for (index, image) in images.iter().enumerate() {
            let reason = match image {
                EnrollmentImage::Unreadable { error, .. } => SkipReason::Unreadable { error: error.clone() },
                EnrollmentImage::Decoded { image, .. } => match self.extractor.extract(image, self.backbone) {
                    Ok(mut faces) if faces.len() == 1 => {
                        embeddings.extend(faces.pop());
                        continue;
                    }
                    Ok(faces) if faces.is_empty() => SkipReason::NoFace,
                    Ok(faces) => SkipReason::MultipleFaces { count: faces.len() },
                    Err(e) => SkipReason::ExtractionFailed { error: e.to_string() },
                },
            };
            tracing::warn!(identity, image = image.label(), %reason, "skipping enrollment image");
            skipped.push(SkippedImage {
                identity: identity.to_string(),
                index,
                label: image.label().to_string(),
                reason,
            });
        }

        Collected {
            embeddings,
            skipped,
            submitted: images.len(),
        }
    }

    fn check_trainable(&self, identity: &str, collected: &Collected) -> Result<(), String> {
        let need = self.config.min_images_per_identity;
        let have = collected.embeddings.len();
        if have < need {
            return Err(format!(
                "Not enough valid face images for {identity}: {have} of {} usable, need at least {need}",
                collected.submitted
            ));
        }
        Ok(())
    }
}

fn success_message(identity: &str, collected: &Collected) -> String {
    let used = collected.embeddings.len();
    let rate = used as f32 / collected.submitted.max(1) as f32 * 100.0;
    format!(
        "Successfully trained {identity}: {used}/{} images ({rate:.1}%)",
        collected.submitted
    )
}

/// Read `root/<identity>/*.{jpg,png,...}` into per-identity image lists,
/// sorted by identity and file name.
pub fn load_enrollment_dir(root: &Path) -> Result<Vec<(String, Vec<EnrollmentImage>)>, TrainError> {
    let dir_err = |source| TrainError::Directory {
        path: root.display().to_string(),
        source,
    };

    let mut people: Vec<_> = fs::read_dir(root)
        .map_err(dir_err)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| Some((e.file_name().into_string().ok()?, e.path())))
        .collect();
    people.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(people.len());
    for (identity, folder) in people {
        let mut files: Vec<_> = match fs::read_dir(&folder) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && has_supported_extension(p))
                .collect(),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "cannot read identity folder");
                Vec::new()
            }
        };
        files.sort();
        let images = files.iter().map(|p| EnrollmentImage::from_path(p)).collect();
        out.push((identity, images));
    }
    Ok(out)
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExtractError;
    use crate::types::{BoundingBox, Embedding};
    use image::Luma;

    /// Pixel (0,0) encodes the face count (255 = extractor error),
    /// pixel (1,0) the embedding angle.
    struct FakeExtractor;

    impl EncodingExtractor for FakeExtractor {
        fn extract(
            &mut self,
            image: &GrayImage,
            _backbone: DetectorBackbone,
        ) -> Result<Vec<FaceEmbedding>, ExtractError> {
            let faces = image.get_pixel(0, 0).0[0];
            if faces == 255 {
                return Err(ExtractError::BackboneUnavailable(DetectorBackbone::Fast));
            }
            let angle = image.get_pixel(1, 0).0[0] as f32;
            Ok((0..faces)
                .map(|i| FaceEmbedding {
                    embedding: Embedding::new(vec![1.0, angle / 100.0]),
                    bbox: BoundingBox {
                        x: i as f32 * 10.0,
                        y: 0.0,
                        width: 8.0,
                        height: 8.0,
                        confidence: 0.9,
                        landmarks: None,
                    },
                })
                .collect())
        }
    }

    fn img(faces: u8, angle: u8) -> EnrollmentImage {
        let mut image = GrayImage::new(4, 4);
        image.put_pixel(0, 0, Luma([faces]));
        image.put_pixel(1, 0, Luma([angle]));
        EnrollmentImage::decoded(format!("f{faces}-a{angle}.jpg"), image)
    }

    fn trainer(min_images: usize) -> (tempfile::TempDir, Arc<GalleryStore>, Trainer<FakeExtractor>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(GalleryStore::open(dir.path(), 5).unwrap());
        let config = EngineConfig {
            min_images_per_identity: min_images,
            ..EngineConfig::default()
        };
        let t = Trainer::new(FakeExtractor, config, Arc::clone(&store));
        (dir, store, t)
    }

    #[test]
    fn test_train_below_minimum_leaves_gallery_unchanged() {
        let (_dir, store, mut t) = trainer(3);
        let before = store.current();

        let outcome = t.train("S1", &[img(1, 1), img(1, 2)]).unwrap();

        assert!(!outcome.ok);
        assert!(outcome.message.contains("need at least 3"));
        assert!(outcome.version.is_none());
        assert_eq!(store.current(), before);
        assert!(store.versions().unwrap().is_empty());
    }

    #[test]
    fn test_train_skips_bad_images_and_publishes() {
        let (_dir, store, mut t) = trainer(2);
        let images = [
            img(1, 1),
            img(0, 0),
            img(3, 0),
            img(255, 0),
            EnrollmentImage::Unreadable {
                label: "corrupt.png".into(),
                error: "truncated".into(),
            },
            img(1, 2),
        ];

        let outcome = t.train("S1", &images).unwrap();

        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.embeddings.len(), 2);
        assert_eq!(outcome.version, Some(1));
        let reasons: Vec<_> = outcome.skipped.iter().map(|s| (s.index, s.reason.clone())).collect();
        assert_eq!(reasons[0], (1, SkipReason::NoFace));
        assert_eq!(reasons[1], (2, SkipReason::MultipleFaces { count: 3 }));
        assert!(matches!(reasons[2].1, SkipReason::ExtractionFailed { .. }));
        assert!(matches!(reasons[3].1, SkipReason::Unreadable { .. }));
        assert_eq!(store.current().get("S1").map(|r| r.len()), Some(2));
        assert_eq!(store.current().source_image_counts.get("S1"), Some(&6));
    }

    #[test]
    fn test_retrain_replaces_only_that_identity() {
        let (_dir, store, mut t) = trainer(1);
        t.train("S1", &[img(1, 1)]).unwrap();
        t.train("S2", &[img(1, 50)]).unwrap();
        t.train("S1", &[img(1, 3), img(1, 4)]).unwrap();

        let current = store.current();
        assert_eq!(current.version, 3);
        assert_eq!(current.get("S1").unwrap().len(), 2);
        assert_eq!(current.get("S2").unwrap().len(), 1);
    }

    #[test]
    fn test_train_all_isolates_failures() {
        let (_dir, store, mut t) = trainer(2);
        let summary = t
            .train_all(vec![
                ("S1".into(), vec![img(1, 1), img(1, 2)]),
                ("S2".into(), vec![img(0, 0), img(2, 0)]),
                ("S3".into(), vec![img(1, 5), img(1, 6), img(1, 7)]),
            ])
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.total_persons, 3);
        assert_eq!(summary.trained_count, 2);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.total_encodings, 5);
        assert_eq!(summary.skipped.len(), 2);
        assert_eq!(summary.failed[0].identity, "S2");
        assert_eq!(summary.version, Some(1));
        assert_eq!(store.current().identities(), vec!["S1", "S3"]);
    }

    #[test]
    fn test_train_all_with_nothing_trainable_does_not_publish() {
        let (_dir, store, mut t) = trainer(2);
        let summary = t.train_all(vec![("S1".into(), vec![img(0, 0)])]).unwrap();
        assert!(!summary.success);
        assert_eq!(summary.version, None);
        assert_eq!(store.current().version, 0);
    }

    #[test]
    fn test_load_enrollment_dir_reads_supported_files() {
        let root = tempfile::tempdir().unwrap();
        let s1 = root.path().join("S1");
        fs::create_dir(&s1).unwrap();
        GrayImage::from_pixel(8, 8, Luma([40])).save(s1.join("a.png")).unwrap();
        fs::write(s1.join("b.jpg"), b"garbage").unwrap();
        fs::write(s1.join("notes.txt"), b"ignored").unwrap();
        fs::create_dir(root.path().join("S0")).unwrap();

        let loaded = load_enrollment_dir(root.path()).unwrap();
        let names: Vec<&str> = loaded.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(names, vec!["S0", "S1"]);

        let images = &loaded[1].1;
        assert_eq!(images.len(), 2);
        assert!(matches!(images[0], EnrollmentImage::Decoded { .. }));
        assert!(matches!(images[1], EnrollmentImage::Unreadable { .. }));
    }

    #[test]
    fn test_missing_enrollment_dir_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert!(matches!(
            load_enrollment_dir(&missing),
            Err(TrainError::Directory { .. })
        ));
    }
}
