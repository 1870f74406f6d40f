//! Distance metrics for vector similarity.
//!
//! All metrics are normalised so that **smaller means closer**, which keeps
//! the graph index (greedy search, robust prune) metric-agnostic: cosine and
//! dot product are naturally "higher is better" similarities, so this module
//! negates/complements them into a true distance before handing them to
//! callers.

use serde::{Deserialize, Serialize};

/// Distance metric shared by every vector in a shard (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// L2 norm.
    Euclidean,
    /// `1 - cosine_similarity`.
    Cosine,
    /// `-dot_product`, so that a larger raw dot product is a smaller
    /// distance.
    DotProduct,
    /// Hamming distance over bit-packed vectors (forces binary
    /// quantization, spec §3).
    Hamming,
    /// Jaccard distance over bit-packed vectors (forces binary
    /// quantization, spec §3).
    Jaccard,
}

impl DistanceMetric {
    /// Whether this metric requires the vector store to force binary
    /// quantization (spec §3: "the latter two are internally implemented
    /// by forcing binary quantization").
    #[must_use]
    pub const fn forces_binary_quantization(&self) -> bool {
        matches!(self, DistanceMetric::Hamming | DistanceMetric::Jaccard)
    }

    /// Computes the distance between two equal-length float vectors.
    ///
    /// # Panics
    ///
    /// Panics if `a.len() != b.len()`.
    #[must_use]
    pub fn calculate(&self, a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len(), "vector dimensions must match");
        match self {
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::DotProduct => -dot_product(a, b),
            DistanceMetric::Hamming | DistanceMetric::Jaccard => {
                // Float vectors under these metrics are only ever compared
                // before quantization has happened; fall back to Euclidean
                // as the pre-fit approximation (vector_store::binary falls
                // back to the raw metric before fitting, see spec §4.4).
                euclidean_distance(a, b)
            }
        }
    }

    /// Computes the distance between two bit-packed words arrays of equal
    /// length, used once a `Binary` vector store has fitted.
    ///
    /// # Panics
    ///
    /// Panics if `a.len() != b.len()`.
    #[must_use]
    pub fn calculate_packed(&self, a: &[u64], b: &[u64], bit_len: usize) -> f32 {
        assert_eq!(a.len(), b.len(), "packed word counts must match");
        match self {
            DistanceMetric::Jaccard => jaccard_distance(a, b),
            // Hamming is the default for every other metric once a point is
            // encoded in packed form (Euclidean/Cosine/DotProduct do not
            // themselves force quantization, but once fitted, comparisons
            // between two packed vectors use Hamming as the only metric
            // that is meaningful over bits).
            _ => hamming_distance(a, b, bit_len),
        }
    }

    /// Whether the raw metric (pre-normalisation) treats larger values as
    /// more similar. Exposed for callers that want the un-negated score
    /// (e.g. reporting a cosine similarity score alongside distance).
    #[must_use]
    pub const fn higher_is_better(&self) -> bool {
        matches!(self, DistanceMetric::Cosine | DistanceMetric::DotProduct)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Count of differing bits across equal-length packed word arrays. `bit_len`
/// bounds how many bits of the final word are significant (vectors whose
/// length isn't a multiple of 64 pad the tail with zero bits).
fn hamming_distance(a: &[u64], b: &[u64], bit_len: usize) -> f32 {
    let mut bits_seen = 0usize;
    let mut diff = 0u32;
    for (wa, wb) in a.iter().zip(b.iter()) {
        let remaining = bit_len.saturating_sub(bits_seen).min(64);
        let mask = if remaining >= 64 {
            u64::MAX
        } else {
            (1u64 << remaining) - 1
        };
        diff += ((wa ^ wb) & mask).count_ones();
        bits_seen += 64;
    }
    diff as f32
}

/// Jaccard distance = `1 - |A ∩ B| / |A ∪ B|` over packed bit sets.
fn jaccard_distance(a: &[u64], b: &[u64]) -> f32 {
    let mut intersection = 0u32;
    let mut union = 0u32;
    for (wa, wb) in a.iter().zip(b.iter()) {
        intersection += (wa & wb).count_ones();
        union += (wa | wb).count_ones();
    }
    if union == 0 {
        return 0.0;
    }
    1.0 - (intersection as f32 / union as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_zero_distance_under_every_float_metric() {
        let v = vec![0.3, -0.2, 1.5, 0.0];
        for metric in [
            DistanceMetric::Euclidean,
            DistanceMetric::Cosine,
            DistanceMetric::DotProduct,
        ] {
            let d = metric.calculate(&v, &v);
            if metric == DistanceMetric::DotProduct {
                // distance is -dot(v,v), not necessarily zero; just check
                // it's the minimum possible for this vector pair.
                assert!(d <= 0.0);
            } else {
                assert!(d.abs() < 1e-5, "{metric:?} distance {d}");
            }
        }
    }

    #[test]
    fn euclidean_matches_known_3_4_5_triangle() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![3.0, 4.0, 0.0];
        assert!((DistanceMetric::Euclidean.calculate(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn hamming_counts_bit_differences() {
        let a = vec![0b1010u64];
        let b = vec![0b1100u64];
        assert_eq!(hamming_distance(&a, &b, 4), 2.0);
    }

    #[test]
    fn jaccard_of_disjoint_sets_is_one() {
        let a = vec![0b0011u64];
        let b = vec![0b1100u64];
        assert_eq!(jaccard_distance(&a, &b), 1.0);
    }

    #[test]
    fn forces_binary_quantization_only_for_hamming_and_jaccard() {
        assert!(DistanceMetric::Hamming.forces_binary_quantization());
        assert!(DistanceMetric::Jaccard.forces_binary_quantization());
        assert!(!DistanceMetric::Euclidean.forces_binary_quantization());
    }
}
