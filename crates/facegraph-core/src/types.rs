use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Sentinel identity id meaning "no enrolled identity matched".
pub const NO_MATCH_ID: i64 = -1;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for the default model).
///
/// Always unit-normalized before storage or comparison, which makes L2
/// distance and cosine similarity interchangeable up to a monotonic
/// transform: for unit vectors, L2² = 2 − 2·cos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding from raw model output, L2-normalizing it.
    ///
    /// A zero vector is left unmodified to avoid division by zero.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    /// Wrap already-normalized values without touching them.
    pub fn from_unit(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Squared Euclidean distance — the primary ordering metric.
    pub fn squared_distance(&self, other: &[f32]) -> f32 {
        self.values
            .iter()
            .zip(other.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum()
    }
}

/// Which path produced an aligned tile.
///
/// Callers that care about confidence must inspect this: a `Fallback`
/// tile is a best-effort center crop, not a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentSource {
    Detected,
    Fallback,
}

/// A fixed-size face tile ready for embedding extraction.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub tile: RgbImage,
    pub source: AlignmentSource,
}

/// One ranked result of a similarity query. Transient, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity_id: i64,
    /// Squared Euclidean distance to the probe embedding.
    pub distance: f32,
    /// Derived score `1/(1+d)`, bounded in (0, 1].
    pub similarity: f32,
}
