//! Versioned gallery snapshots and their on-disk store.
//!
//! A [`TrainedModel`] is immutable once published. The store keeps the
//! serving snapshot behind an [`ArcSwap`] so readers never take a lock and
//! a publish is a single pointer swap. On disk every version is its own
//! JSON file, written to a temp file and renamed into place, and a
//! `CURRENT` pointer (also replaced by rename) names the serving version.

use crate::types::FaceEmbedding;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const SNAPSHOT_FORMAT: u32 = 1;
const POINTER_FILE: &str = "CURRENT";
const SNAPSHOT_PREFIX: &str = "gallery-";
const SNAPSHOT_SUFFIX: &str = ".json";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery io: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery snapshot is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
    #[error("gallery snapshot format {0} is not supported")]
    UnsupportedFormat(u32),
    #[error("gallery version {0} not found")]
    VersionNotFound(u64),
    #[error("no earlier gallery version to roll back to")]
    NoPreviousVersion,
    #[error("embedding dimension mismatch for '{identity}': expected {expected}, got {actual}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
}

/// One gallery snapshot: identity → reference embeddings, plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub format: u32,
    /// 0 for a model that has never been saved.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    entries: BTreeMap<String, Vec<FaceEmbedding>>,
    /// Images submitted per identity, including the ones that were skipped.
    pub source_image_counts: BTreeMap<String, usize>,
}

/// Summary numbers for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub version: u64,
    pub total_encodings: usize,
    pub unique_persons: usize,
    pub known_persons: Vec<String>,
}

impl TrainedModel {
    pub fn empty() -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            version: 0,
            created_at: Utc::now(),
            entries: BTreeMap::new(),
            source_image_counts: BTreeMap::new(),
        }
    }

    /// Copy of `self` with `identity`'s references replaced.
    ///
    /// An empty `embeddings` list removes the identity instead: entries
    /// without references never take part in matching.
    pub fn with_identity(
        &self,
        identity: &str,
        embeddings: Vec<FaceEmbedding>,
        source_images: usize,
    ) -> Self {
        let mut next = self.clone();
        next.version = 0;
        next.created_at = Utc::now();
        next.insert(identity, embeddings, source_images);
        next
    }

    /// In-place variant of [`with_identity`](Self::with_identity) for building a
    /// model that has not been published yet.
    pub fn insert(&mut self, identity: &str, embeddings: Vec<FaceEmbedding>, source_images: usize) {
        if embeddings.is_empty() {
            self.entries.remove(identity);
            self.source_image_counts.remove(identity);
        } else {
            self.entries.insert(identity.to_string(), embeddings);
            self.source_image_counts.insert(identity.to_string(), source_images);
        }
    }

    pub fn get(&self, identity: &str) -> Option<&[FaceEmbedding]> {
        self.entries.get(identity).map(Vec::as_slice)
    }

    /// Iterate identities in key order with their references.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[FaceEmbedding])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn identities(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_encodings(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            version: self.version,
            total_encodings: self.total_encodings(),
            unique_persons: self.entries.len(),
            known_persons: self.identities(),
        }
    }

    /// Embedding dimension shared by every reference, if any exist.
    pub fn dimension(&self) -> Option<usize> {
        self.entries
            .values()
            .flat_map(|refs| refs.iter())
            .map(|f| f.embedding.dim())
            .next()
    }

    /// Check that every reference has the same dimension.
    pub fn validate(&self) -> Result<(), GalleryError> {
        let Some(expected) = self.dimension() else {
            return Ok(());
        };
        for (identity, refs) in &self.entries {
            if let Some(bad) = refs.iter().find(|f| f.embedding.dim() != expected) {
                return Err(GalleryError::DimensionMismatch {
                    identity: identity.clone(),
                    expected,
                    actual: bad.embedding.dim(),
                });
            }
        }
        Ok(())
    }
}

/// Directory-backed, versioned gallery with an in-memory serving snapshot.
pub struct GalleryStore {
    dir: PathBuf,
    retain_versions: usize,
    current: ArcSwap<TrainedModel>,
    /// Serialises writers within this process; readers never touch it.
    write_lock: Mutex<()>,
}

impl GalleryStore {
    /// Open (creating if needed) the store at `dir` and load the current version.
    pub fn open(dir: impl Into<PathBuf>, retain_versions: usize) -> Result<Self, GalleryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            retain_versions: retain_versions.max(crate::config::MIN_RETAIN_VERSIONS),
            current: ArcSwap::from_pointee(TrainedModel::empty()),
            write_lock: Mutex::new(()),
        };
        let loaded = store.load()?;
        tracing::info!(
            dir = %store.dir.display(),
            version = loaded.version,
            persons = loaded.stats().unique_persons,
            "gallery store opened"
        );
        store.current.store(Arc::new(loaded));
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The serving snapshot. Lock-free; stays valid while the caller holds it.
    pub fn current(&self) -> Arc<TrainedModel> {
        self.current.load_full()
    }

    /// Read the latest persisted version from disk without changing `current`.
    ///
    /// Returns an empty model (version 0) when nothing has been saved yet.
    pub fn load(&self) -> Result<TrainedModel, GalleryError> {
        match self.pointed_version()? {
            Some(version) => self.load_version(version),
            None => match self.versions()?.last() {
                Some(&latest) => self.load_version(latest),
                None => Ok(TrainedModel::empty()),
            },
        }
    }

    /// Re-read disk and swap the serving snapshot.
    pub fn reload(&self) -> Result<Arc<TrainedModel>, GalleryError> {
        let model = Arc::new(self.load()?);
        self.current.store(Arc::clone(&model));
        tracing::info!(version = model.version, "gallery reloaded");
        Ok(model)
    }

    pub fn load_version(&self, version: u64) -> Result<TrainedModel, GalleryError> {
        let path = self.snapshot_path(version);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GalleryError::VersionNotFound(version))
            }
            Err(e) => return Err(e.into()),
        };
        let model: TrainedModel = serde_json::from_slice(&bytes)?;
        if model.format != SNAPSHOT_FORMAT {
            return Err(GalleryError::UnsupportedFormat(model.format));
        }
        model.validate()?;
        Ok(model)
    }

    /// Persisted versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, GalleryError> {
        let mut versions: Vec<u64> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_prefix(SNAPSHOT_PREFIX)?
                    .strip_suffix(SNAPSHOT_SUFFIX)?
                    .parse()
                    .ok()
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Persist `model` as a new version and point `CURRENT` at it.
    ///
    /// The serving snapshot is not touched; see [`publish`](Self::publish).
    pub fn save(&self, model: &TrainedModel) -> Result<TrainedModel, GalleryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.save_locked(model)
    }

    /// Persist `model` and make it the serving snapshot.
    pub fn publish(&self, model: &TrainedModel) -> Result<Arc<TrainedModel>, GalleryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let saved = Arc::new(self.save_locked(model)?);
        self.current.store(Arc::clone(&saved));
        tracing::info!(
            version = saved.version,
            persons = saved.stats().unique_persons,
            encodings = saved.total_encodings(),
            "gallery published"
        );
        Ok(saved)
    }

    /// Derive the next model from the serving one and publish it, holding the
    /// writer lock across both so concurrent updates cannot drop each other.
    pub fn update<F>(&self, derive: F) -> Result<Arc<TrainedModel>, GalleryError>
    where
        F: FnOnce(&TrainedModel) -> TrainedModel,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = derive(&self.current());
        let saved = Arc::new(self.save_locked(&next)?);
        self.current.store(Arc::clone(&saved));
        tracing::info!(version = saved.version, "gallery updated");
        Ok(saved)
    }

    /// Serve the version before the current one and persist that choice.
    pub fn rollback(&self) -> Result<Arc<TrainedModel>, GalleryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let serving = self.current().version;
        let previous = self
            .versions()?
            .into_iter()
            .filter(|&v| v < serving)
            .next_back()
            .ok_or(GalleryError::NoPreviousVersion)?;

        let model = Arc::new(self.load_version(previous)?);
        self.write_pointer(previous)?;
        self.current.store(Arc::clone(&model));
        tracing::warn!(from = serving, to = previous, "gallery rolled back");
        Ok(model)
    }

    fn save_locked(&self, model: &TrainedModel) -> Result<TrainedModel, GalleryError> {
        model.validate()?;
        let version = self.versions()?.last().copied().unwrap_or(0) + 1;
        let mut versioned = model.clone();
        versioned.version = version;
        versioned.format = SNAPSHOT_FORMAT;

        let bytes = serde_json::to_vec(&versioned)?;
        write_atomic(&self.dir, &self.snapshot_path(version), &bytes)?;
        self.write_pointer(version)?;
        self.prune(version)?;
        tracing::debug!(version, bytes = bytes.len(), "gallery snapshot written");
        Ok(versioned)
    }

    fn prune(&self, keep_at_least: u64) -> Result<(), GalleryError> {
        let versions = self.versions()?;
        let cutoff = versions.len().saturating_sub(self.retain_versions);
        for &old in &versions[..cutoff] {
            if old == keep_at_least {
                continue;
            }
            if let Err(e) = fs::remove_file(self.snapshot_path(old)) {
                tracing::warn!(version = old, error = %e, "failed to prune gallery version");
            }
        }
        Ok(())
    }

    fn pointed_version(&self) -> Result<Option<u64>, GalleryError> {
        match fs::read_to_string(self.dir.join(POINTER_FILE)) {
            Ok(text) => match text.trim().parse() {
                Ok(v) => Ok(Some(v)),
                Err(_) => {
                    tracing::warn!(content = %text.trim(), "ignoring unreadable gallery pointer");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_pointer(&self, version: u64) -> Result<(), GalleryError> {
        write_atomic(&self.dir, &self.dir.join(POINTER_FILE), version.to_string().as_bytes())?;
        Ok(())
    }

    fn snapshot_path(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{SNAPSHOT_PREFIX}{version:08}{SNAPSHOT_SUFFIX}"))
    }
}

/// Write `bytes` to `target` via a synced temp file and a rename.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot");
    let tmp = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    // Persist the rename itself where the platform allows opening directories.
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    fn face(values: &[f32]) -> FaceEmbedding {
        FaceEmbedding {
            embedding: Embedding::new(values.to_vec()),
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.99,
                landmarks: None,
            },
        }
    }

    fn model_with(ids: &[&str]) -> TrainedModel {
        let mut m = TrainedModel::empty();
        for (i, id) in ids.iter().enumerate() {
            m.insert(id, vec![face(&[i as f32, 1.0])], 3);
        }
        m
    }

    #[test]
    fn test_empty_store_loads_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        assert_eq!(store.current().version, 0);
        assert!(store.current().is_empty());
        assert!(store.versions().unwrap().is_empty());
    }

    #[test]
    fn test_publish_assigns_increasing_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        let v1 = store.publish(&model_with(&["S1"])).unwrap();
        let v2 = store.publish(&model_with(&["S1", "S2"])).unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(store.current().version, 2);
        assert_eq!(store.current().identities(), vec!["S1", "S2"]);
    }

    #[test]
    fn test_load_is_idempotent_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = GalleryStore::open(dir.path(), 5).unwrap();
            store.publish(&model_with(&["S1", "S2"])).unwrap();
        }
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        let a = store.load().unwrap();
        let b = store.load().unwrap();
        assert_eq!(a, b);
        assert_eq!(store.current().stats().unique_persons, 2);
    }

    #[test]
    fn test_save_does_not_swap_current_until_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        store.publish(&model_with(&["S1"])).unwrap();
        store.save(&model_with(&["S1", "S2"])).unwrap();

        assert_eq!(store.current().version, 1);
        assert_eq!(store.load().unwrap().version, 2);
        assert_eq!(store.reload().unwrap().version, 2);
        assert_eq!(store.current().version, 2);
    }

    #[test]
    fn test_rollback_serves_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        store.publish(&model_with(&["S1"])).unwrap();
        store.publish(&model_with(&["S1", "S2"])).unwrap();

        let rolled = store.rollback().unwrap();
        assert_eq!(rolled.version, 1);
        assert_eq!(store.current().identities(), vec!["S1"]);
        // The pointer is persisted, so a fresh load agrees.
        assert_eq!(store.load().unwrap().version, 1);
        assert!(matches!(store.rollback(), Err(GalleryError::NoPreviousVersion)));
    }

    #[test]
    fn test_prune_keeps_retained_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 2).unwrap();
        for _ in 0..4 {
            store.publish(&model_with(&["S1"])).unwrap();
        }
        assert_eq!(store.versions().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_leftover_temp_file_is_not_a_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        store.publish(&model_with(&["S1"])).unwrap();
        // Simulate a crash mid-write of version 2.
        fs::write(dir.path().join(".gallery-00000002.json.999.tmp"), b"{\"trunc").unwrap();

        assert_eq!(store.versions().unwrap(), vec![1]);
        assert_eq!(store.load().unwrap().version, 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 5).unwrap();
        let mut m = model_with(&["S1"]);
        m.insert("S2", vec![face(&[1.0, 2.0, 3.0])], 3);
        assert!(matches!(
            store.publish(&m),
            Err(GalleryError::DimensionMismatch { .. })
        ));
        assert_eq!(store.current().version, 0);
    }

    #[test]
    fn test_concurrent_updates_keep_every_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path(), 50).unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..5 {
                        let id = format!("T{t}-{i}");
                        store
                            .update(|m| m.with_identity(&id, vec![face(&[1.0, 0.0])], 1))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(store.current().stats().unique_persons, 20);
        assert_eq!(store.current().version, 20);
    }

    #[test]
    fn test_with_identity_copies_and_empty_removes() {
        let base = model_with(&["S1", "S2"]);
        let next = base.with_identity("S2", Vec::new(), 2);
        assert_eq!(base.identities(), vec!["S1", "S2"]);
        assert_eq!(next.identities(), vec!["S1"]);
        assert!(next.source_image_counts.get("S2").is_none());
    }
}
