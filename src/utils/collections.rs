//! Collection constructors and small vector helpers.
//!
//! `FxHashMap` is the map type used throughout the crate for state
//! channels and registries; these constructors keep call sites terse.

use rustc_hash::FxHashMap;

/// A new empty `FxHashMap` with default capacity.
#[must_use]
pub fn new_map<K, V>() -> FxHashMap<K, V> {
    FxHashMap::default()
}

/// A new `FxHashMap` sized for `capacity` entries.
#[must_use]
pub fn with_capacity<K, V>(capacity: usize) -> FxHashMap<K, V> {
    FxHashMap::with_capacity_and_hasher(capacity, Default::default())
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 when either vector has zero magnitude or the lengths
/// differ, so callers never divide by zero on degenerate embeddings.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Dot product of two equal-length vectors; 0.0 on length mismatch.
#[must_use]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
