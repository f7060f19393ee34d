//! Match decisions over ranked candidate lists.
//!
//! Distances are remapped to similarity scores `s = 1/(1+d)`, bounded in
//! (0, 1] and monotonically decreasing in distance. Best-match mode never
//! returns a candidate below the threshold even if it is the closest one
//! available; "closest" is not "same".

use crate::types::{MatchCandidate, NO_MATCH_ID};

/// Remap a distance to a similarity score in (0, 1].
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Best-match mode: the top candidate's identity iff its similarity meets
/// the threshold, else [`NO_MATCH_ID`]. Empty candidate lists are a normal
/// outcome, not an error.
pub fn best_match(candidates: &[MatchCandidate], threshold: f32) -> i64 {
    match candidates.first() {
        Some(top) if top.similarity >= threshold => top.identity_id,
        _ => NO_MATCH_ID,
    }
}

/// Ranked-results mode: the top-k candidates regardless of threshold, for
/// caller-side inspection.
pub fn ranked(candidates: &[MatchCandidate], k: usize) -> Vec<MatchCandidate> {
    candidates.iter().take(k).cloned().collect()
}
