use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are always expressed in the pixel space of the image the
/// caller handed in, even when detection ran on a downscaled copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Scale box and landmarks by `factor` (used to undo a downscale).
    pub fn rescaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector, L2-normalised by the recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance `1 - similarity`, in [0, 2].
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Return an L2-normalised copy. Zero vectors are returned unchanged.
    pub fn normalized(values: Vec<f32>) -> Vec<f32> {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.into_iter().map(|x| x / norm).collect()
        } else {
            values
        }
    }
}

/// One detected face: its embedding plus where it was found.
///
/// Produced fresh for every image or frame and never shared between frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
}

/// Outcome identity of a match: an enrolled student or nobody.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn as_known(&self) -> Option<&str> {
        match self {
            Identity::Known(id) => Some(id),
            Identity::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Identity::Unknown)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(id) => f.write_str(id),
            Identity::Unknown => f.write_str("unknown"),
        }
    }
}

/// Why a [`MatchResult`] came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchVerdict {
    Accepted,
    BelowThreshold,
    /// Two distinct identities scored within the tie epsilon of each other.
    Ambiguous,
    EmptyGallery,
}

/// Result of matching one probe face against a gallery snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity: Identity,
    /// Confidence of the best candidate in [0, 1], reported even when rejected.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub verdict: MatchVerdict,
    /// Gallery version the match was computed against.
    pub gallery_version: u64,
}

impl MatchResult {
    pub fn is_accepted(&self) -> bool {
        self.verdict == MatchVerdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        let a = emb(&[1.0, 0.0]);
        assert!(a.similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
        assert!((a.distance(&emb(&[-1.0, 0.0])) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        assert_eq!(a.similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_normalized_unit_length() {
        let v = Embedding::normalized(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(Embedding::normalized(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_bbox_rescaled_maps_landmarks() {
        let b = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: Some([(1.0, 2.0); 5]),
        };
        let r = b.rescaled(2.0);
        assert_eq!((r.x, r.y, r.width, r.height), (20.0, 40.0, 60.0, 80.0));
        assert_eq!(r.landmarks.unwrap()[0], (2.0, 4.0));
        assert_eq!(r.confidence, 0.9);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Known("S1".into()).to_string(), "S1");
        assert_eq!(Identity::Unknown.to_string(), "unknown");
        assert!(Identity::Unknown.as_known().is_none());
    }
}
