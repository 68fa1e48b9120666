//! Vector utilities shared by the similarity and search subsystems.
//!
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`pair_key`] — canonical cache key for an unordered pair of hashes
//! - [`rank_by_similarity`] — threshold, sort, and truncate a candidate set
//!
//! Embedding inference itself lives in the `repo-client` crate.

use std::cmp::Ordering;
use std::collections::HashMap;

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
///
/// # Formula
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Canonical key for an unordered pair: the two hashes sorted and joined
/// with `-`, so `pair_key(a, b) == pair_key(b, a)`.
///
/// ```rust
/// use repo_client_core::embedding::pair_key;
///
/// assert_eq!(pair_key("b", "a"), "a-b");
/// assert_eq!(pair_key("a", "b"), pair_key("b", "a"));
/// ```
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}-{}", a, b)
    } else {
        format!("{}-{}", b, a)
    }
}

/// A candidate id with its similarity to a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
}

/// Score every vector in `candidates` against `query`, drop scores below
/// `threshold`, sort descending (ties by id), and keep at most `limit`.
pub fn rank_by_similarity(
    query: &[f32],
    candidates: &HashMap<String, Vec<f32>>,
    threshold: f64,
    limit: usize,
) -> Vec<ScoredId> {
    let mut scored: Vec<ScoredId> = candidates
        .iter()
        .map(|(id, vector)| ScoredId {
            id: id.clone(),
            score: cosine_similarity(query, vector) as f64,
        })
        .filter(|s| s.score >= threshold)
        .collect();

    sort_scored(&mut scored);
    scored.truncate(limit);
    scored
}

/// Sort by descending score, then ascending id for a stable order.
pub fn sort_scored(scored: &mut [ScoredId]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_pair_key_is_order_independent() {
        assert_eq!(pair_key("h2", "h1"), "h1-h2");
        assert_eq!(pair_key("h1", "h2"), "h1-h2");
    }

    #[test]
    fn test_rank_applies_threshold_before_limit() {
        let mut candidates = HashMap::new();
        candidates.insert("close".to_string(), vec![1.0, 0.1]);
        candidates.insert("closer".to_string(), vec![1.0, 0.0]);
        candidates.insert("far".to_string(), vec![0.0, 1.0]);
        candidates.insert("opposite".to_string(), vec![-1.0, 0.0]);

        let ranked = rank_by_similarity(&[1.0, 0.0], &candidates, 0.1, 10);
        let ids: Vec<&str> = ranked.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["closer", "close"]);

        let limited = rank_by_similarity(&[1.0, 0.0], &candidates, 0.1, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "closer");
    }
}
