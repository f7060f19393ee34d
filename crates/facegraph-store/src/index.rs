//! Brute-force similarity index over enrolled embeddings.
//!
//! Correct-by-construction reference implementation of the search
//! contract: up to k candidates ascending by squared Euclidean distance,
//! ties broken by identity id. A faster index structure may replace the
//! scan as long as that ordering contract holds.

use facegraph_core::matcher::similarity_from_distance;
use facegraph_core::types::{Embedding, MatchCandidate};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// In-memory index of (identity id, unit-normalized embedding) pairs.
///
/// All mutation happens behind the write lock; an in-flight query sees
/// either the pre- or post-update state of a concurrently-enrolling
/// identity, never a partially-written vector.
#[derive(Default)]
pub struct SimilarityIndex {
    entries: RwLock<BTreeMap<i64, Vec<f32>>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one identity's vector, replacing any prior vector for that
    /// id (at most one live embedding per identity).
    pub fn enroll(&self, identity_id: i64, embedding: &Embedding) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(identity_id, embedding.values.clone());
    }

    /// Up to `k` nearest enrolled vectors, ascending by squared Euclidean
    /// distance, ties broken by identity id. Empty index → empty list.
    pub fn query(&self, probe: &Embedding, k: usize) -> Vec<MatchCandidate> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());

        let mut candidates: Vec<MatchCandidate> = entries
            .iter()
            .map(|(&id, values)| {
                let distance = probe.squared_distance(values);
                MatchCandidate {
                    identity_id: id,
                    distance,
                    similarity: similarity_from_distance(distance),
                }
            })
            .collect();

        // BTreeMap iterates in id order, so a stable sort by distance
        // leaves equal-distance candidates ordered by id.
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);
        candidates
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity_id: i64) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&identity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::from_raw(values)
    }

    #[test]
    fn test_empty_index_returns_empty_list() {
        let index = SimilarityIndex::new();
        assert!(index.query(&unit(vec![1.0, 0.0]), 5).is_empty());
    }

    #[test]
    fn test_exact_match_distance_zero() {
        let index = SimilarityIndex::new();
        let e = unit(vec![0.6, 0.8]);
        index.enroll(42, &e);

        let results = index.query(&e, 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity_id, 42);
        assert!(results[0].distance.abs() < 1e-6);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ordering_ascending_by_distance() {
        let index = SimilarityIndex::new();
        index.enroll(1, &unit(vec![0.0, 1.0]));
        index.enroll(2, &unit(vec![1.0, 0.0]));
        index.enroll(3, &unit(vec![1.0, 0.1]));

        let results = index.query(&unit(vec![1.0, 0.0]), 3);
        assert_eq!(results[0].identity_id, 2);
        assert_eq!(results[1].identity_id, 3);
        assert_eq!(results[2].identity_id, 1);
        assert!(results[0].distance <= results[1].distance);
        assert!(results[1].distance <= results[2].distance);
    }

    #[test]
    fn test_tie_broken_by_identity_id() {
        let index = SimilarityIndex::new();
        // Two enrolled vectors equidistant from the probe
        index.enroll(9, &unit(vec![0.0, 1.0]));
        index.enroll(4, &unit(vec![0.0, -1.0]));

        let results = index.query(&unit(vec![1.0, 0.0]), 2);
        assert_eq!(results[0].identity_id, 4);
        assert_eq!(results[1].identity_id, 9);
    }

    #[test]
    fn test_top_k_truncation() {
        let index = SimilarityIndex::new();
        for id in 0..10 {
            index.enroll(id, &unit(vec![id as f32 + 1.0, 1.0]));
        }
        assert_eq!(index.query(&unit(vec![1.0, 1.0]), 3).len(), 3);
    }

    #[test]
    fn test_enroll_replaces_prior_vector() {
        let index = SimilarityIndex::new();
        index.enroll(1, &unit(vec![1.0, 0.0]));
        index.enroll(1, &unit(vec![0.0, 1.0]));

        assert_eq!(index.len(), 1);
        let results = index.query(&unit(vec![0.0, 1.0]), 1);
        assert!(results[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_concurrent_enrolls_none_lost() {
        let index = Arc::new(SimilarityIndex::new());
        let mut handles = Vec::new();

        for id in 0..32i64 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                index.enroll(id, &unit(vec![id as f32, 1.0, 2.0]));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let results = index.query(&unit(vec![1.0, 1.0, 1.0]), 100);
        assert_eq!(results.len(), 32);
        let mut ids: Vec<i64> = results.iter().map(|c| c.identity_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);
    }
}
