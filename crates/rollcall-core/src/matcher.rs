//! Nearest-reference matching against a gallery snapshot.
//!
//! Distance is cosine distance `1 - cos(probe, reference)` and confidence
//! is `clamp(1 - distance, 0, 1)`. An identity's score is its single
//! closest reference, not an average over its references. A probe is
//! accepted when `confidence >= threshold`; if the runner-up identity is
//! within `tie_epsilon` of the best, the result is unknown.

use crate::config::EngineConfig;
use crate::gallery::TrainedModel;
use crate::types::{FaceEmbedding, Identity, MatchResult, MatchVerdict};

/// Strategy for comparing a probe face against a gallery snapshot.
///
/// Implementations must be pure: same probe and snapshot, same result.
pub trait Matcher {
    fn compare(&self, probe: &FaceEmbedding, gallery: &TrainedModel) -> MatchResult;

    /// Match every face of one frame, preserving detection order.
    fn compare_all(&self, probes: &[FaceEmbedding], gallery: &TrainedModel) -> Vec<MatchResult> {
        probes.iter().map(|p| self.compare(p, gallery)).collect()
    }
}

/// Monotonic distance → confidence mapping.
pub fn confidence_from_distance(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Nearest single reference wins, ambiguity reported as unknown.
#[derive(Debug, Clone)]
pub struct NearestMatcher {
    threshold: f32,
    tie_epsilon: f32,
}

impl NearestMatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            threshold: config.confidence_threshold,
            tie_epsilon: config.tie_epsilon,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Matcher for NearestMatcher {
    fn compare(&self, probe: &FaceEmbedding, gallery: &TrainedModel) -> MatchResult {
        let dim = probe.embedding.dim();
        // (identity, confidence) of the best and second-best distinct identities.
        let mut best: Option<(&str, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for (identity, references) in gallery.entries() {
            let closest = references
                .iter()
                .filter(|r| r.embedding.dim() == dim)
                .map(|r| probe.embedding.distance(&r.embedding))
                .fold(None, |acc: Option<f32>, d| Some(acc.map_or(d, |a| a.min(d))));
            let Some(distance) = closest else {
                continue;
            };
            let confidence = confidence_from_distance(distance);

            match best {
                Some((_, top)) if confidence <= top => {
                    runner_up = Some(runner_up.map_or(confidence, |r| r.max(confidence)));
                }
                _ => {
                    if let Some((_, top)) = best {
                        runner_up = Some(runner_up.map_or(top, |r| r.max(top)));
                    }
                    best = Some((identity, confidence));
                }
            }
        }

        let (identity, confidence, verdict) = match best {
            None => (Identity::Unknown, 0.0, MatchVerdict::EmptyGallery),
            Some((_, confidence)) if confidence < self.threshold => {
                (Identity::Unknown, confidence, MatchVerdict::BelowThreshold)
            }
            Some((_, confidence))
                if runner_up.is_some_and(|r| confidence - r <= self.tie_epsilon) =>
            {
                (Identity::Unknown, confidence, MatchVerdict::Ambiguous)
            }
            Some((id, confidence)) => (Identity::Known(id.to_string()), confidence, MatchVerdict::Accepted),
        };

        MatchResult {
            identity,
            confidence,
            bbox: probe.bbox.clone(),
            verdict,
            gallery_version: gallery.version,
        }
    }
}
