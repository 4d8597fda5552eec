//! Distance kernels and metric dispatch.
//!
//! For L2-normalized vectors (unit length), dot product equals cosine
//! similarity:
//!
//! ```text
//! cos(θ) = A · B  when ||A|| = ||B|| = 1
//! ```
//!
//! The kernels are plain iterator loops; LLVM auto-vectorizes them when the
//! target allows it.

/// Distance metric for a graph or index.
///
/// Internally every metric is folded into a distance where *smaller means
/// closer*; [`Metric::score`] converts back to the caller-facing score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Cosine similarity over L2-normalized inputs. Scores in [-1, 1].
    Cosine,
    /// Euclidean distance. Lower score is more similar.
    L2,
    /// Raw inner product. Higher score is more similar.
    Dot,
}

impl Metric {
    /// Distance under this metric; smaller is closer.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => 1.0 - dot_product(a, b),
            Metric::L2 => l2_distance(a, b),
            Metric::Dot => -dot_product(a, b),
        }
    }

    /// Convert an internal distance back to the caller-facing score.
    ///
    /// Cosine scores are clamped to [-1, 1] so float drift in the kernel
    /// never leaks out of the documented range.
    #[inline]
    pub fn score(self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => (1.0 - distance).clamp(-1.0, 1.0),
            Metric::L2 => distance,
            Metric::Dot => -distance,
        }
    }

    /// Whether higher scores rank first under this metric.
    #[inline]
    pub fn descending(self) -> bool {
        !matches!(self, Metric::L2)
    }

    /// Whether inputs should be L2-normalized before storage and search.
    #[inline]
    pub fn normalizes(self) -> bool {
        matches!(self, Metric::Cosine)
    }

    /// Wire tag used by the index serialization format.
    pub fn tag(self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::L2 => 1,
            Metric::Dot => 2,
        }
    }

    /// Inverse of [`Metric::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::Cosine),
            1 => Some(Metric::L2),
            2 => Some(Metric::Dot),
            _ => None,
        }
    }
}

/// Dot product of two equal-length vectors.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector length mismatch");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Squared Euclidean distance (no sqrt).
#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector length mismatch");
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Euclidean distance.
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

/// L2 normalize, returning a new vector. Zero vectors pass through.
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let norm = dot_product(v, v).sqrt();
    if norm > f32::EPSILON {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
