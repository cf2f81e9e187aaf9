//! Distance kernels over float32 vectors.
//!
//! All kernels return a non-negative-leaning score where smaller means more
//! similar, so result heaps and radius thresholds compare uniformly across
//! metrics. Dot product is stored negated for that reason and is the one
//! kernel that can go below zero.

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// The supported distance metrics. Discriminants are part of the wire format
/// and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Distance {
    Euclidean = 0,
    Cosine = 1,
    DotProduct = 2,
    Manhattan = 3,
    Hamming = 4,
}

impl Distance {
    /// Computes the distance between two vectors of equal dimension.
    pub fn compute(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        match self {
            Distance::Euclidean => euclidean_squared(a, b).sqrt(),
            Distance::Cosine => cosine(a, b),
            Distance::DotProduct => -dot(a, b),
            Distance::Manhattan => manhattan(a, b),
            Distance::Hamming => hamming(a, b),
        }
    }

    /// Decodes a metric from its wire discriminant.
    pub fn from_u8(tag: u8) -> CResult<Self> {
        Ok(match tag {
            0 => Distance::Euclidean,
            1 => Distance::Cosine,
            2 => Distance::DotProduct,
            3 => Distance::Manhattan,
            4 => Distance::Hamming,
            other => return Err(Error::Corrupted(format!("unknown metric tag {}", other))),
        })
    }
}

impl Default for Distance {
    fn default() -> Self {
        Distance::Euclidean
    }
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Distance::Euclidean => "euclidean",
            Distance::Cosine => "cosine",
            Distance::DotProduct => "dot",
            Distance::Manhattan => "manhattan",
            Distance::Hamming => "hamming",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Distance {
    type Err = Error;

    fn from_str(s: &str) -> CResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Distance::Euclidean),
            "cosine" => Ok(Distance::Cosine),
            "dot" | "dotproduct" | "ip" => Ok(Distance::DotProduct),
            "manhattan" | "l1" => Ok(Distance::Manhattan),
            "hamming" => Ok(Distance::Hamming),
            other => Err(Error::InvalidInput(format!("unknown metric {:?}", other))),
        }
    }
}

/// Squared euclidean distance. Cheaper than the rooted form and order
/// preserving, so internal scans use it where only ranking matters.
pub(crate) fn euclidean_squared(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for i in 0..a.len() {
        let d = a[i] - b[i];
        acc += d * d;
    }
    acc
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for i in 0..a.len() {
        acc += a[i] * b[i];
    }
    acc
}

pub(crate) fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Cosine distance `1 - cos(a, b)`. Zero-norm inputs yield exactly 1.0.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na = norm(a);
    let nb = norm(b);
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / (na * nb)
}

fn manhattan(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for i in 0..a.len() {
        acc += (a[i] - b[i]).abs();
    }
    acc
}

/// Hamming distance over the raw f32 bit patterns. Meaningful for quantized
/// or bit-packed vectors stored as floats.
fn hamming(a: &[f32], b: &[f32]) -> f32 {
    let mut bits = 0u32;
    for i in 0..a.len() {
        bits += (a[i].to_bits() ^ b[i].to_bits()).count_ones();
    }
    bits as f32
}
