//! Hybrid search: the shared fusion/diversity/tie-break machinery used by
//! the memory manager, the code indexer's `find_code`, and the rule engine.
//!
//! The adjustment stages specific to memories (recency/outcome/pin/file
//! scope) live in [`crate::memory::manager`]; this module only implements
//! the parts identical across all three callers: min-max score fusion,
//! diversity capping, and the tie-break ordering.

use std::collections::HashMap;

/// Min-max normalize a score list to [0, 1]. A single-element or
/// all-equal list normalizes to 1.0 everywhere (avoids division by zero
/// while still ranking consistently).
fn min_max_normalize(scores: &[(String, f32)]) -> HashMap<String, f32> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f32::INFINITY, f32::min);
    let max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    scores
        .iter()
        .map(|(id, s)| {
            let normalized = if range > 1e-9 { (s - min) / range } else { 1.0 };
            (id.clone(), normalized)
        })
        .collect()
}

/// Fuse lexical and vector candidate lists: `final = (1 - w) * norm(lex)
/// + w * norm(vec)`. IDs present in only one
/// list are scored using that list's normalized value alone (the other
/// term contributes 0).
///
/// `weight` is clamped to [0, 1]. If `vector` is empty the result is pure
/// lexical (weight is effectively ignored), matching the "vectors
/// unavailable" degradation path.
pub fn fuse_scores(
    lexical: &[(String, f32)],
    vector: &[(String, f32)],
    weight: f32,
) -> HashMap<String, f32> {
    let w = weight.clamp(0.0, 1.0);
    if vector.is_empty() {
        return min_max_normalize(lexical);
    }

    let norm_lex = min_max_normalize(lexical);
    let norm_vec = min_max_normalize(vector);

    let mut fused: HashMap<String, f32> = HashMap::new();
    for (id, score) in &norm_lex {
        *fused.entry(id.clone()).or_insert(0.0) += (1.0 - w) * score;
    }
    for (id, score) in &norm_vec {
        *fused.entry(id.clone()).or_insert(0.0) += w * score;
    }
    fused
}

/// A scored candidate carrying the fields needed for diversity capping and
/// tie-breaking, independent of whether it backs a memory or code entity.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub id: String,
    pub score: f32,
    pub file_path: Option<String>,
    /// Used as a tie-break before id; memories use access_count, entities
    /// can pass 0 if not applicable.
    pub access_count: i64,
    /// Used as a secondary tie-break; more recent wins.
    pub created_at_unix: i64,
    /// Final tie-break: lower id wins. Callers should supply a value that
    /// sorts consistently with their id's natural order (e.g. the integer
    /// memory id, or a stable hash for string entity ids).
    pub tie_break_id: i64,
}

/// Sort candidates by score descending, then by the tie-break rule: higher
/// access_count, then more recent created_at, then lower id.
pub fn sort_with_tiebreak(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.access_count.cmp(&a.access_count))
            .then_with(|| b.created_at_unix.cmp(&a.created_at_unix))
            .then_with(|| a.tie_break_id.cmp(&b.tie_break_id))
    });
}

/// Walk `candidates` (already sorted by score) and drop any whose
/// `file_path` has already been emitted `max_per_file` times. Candidates
/// with no `file_path` are never capped.
pub fn apply_diversity_cap(
    candidates: Vec<ScoredCandidate>,
    max_per_file: usize,
) -> Vec<ScoredCandidate> {
    let mut per_file_count: HashMap<String, usize> = HashMap::new();
    let mut result = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if let Some(path) = &candidate.file_path {
            let count = per_file_count.entry(path.clone()).or_insert(0);
            if *count >= max_per_file {
                continue;
            }
            *count += 1;
        }
        result.push(candidate);
    }
    result
}

/// 30-day half-life recency decay: `exp(-delta_days * ln(2) / 30)`.
/// Callers apply this only to non-permanent memories; permanent memories
/// (and pinned ones) skip recency entirely, yielding a constant
/// multiplier of 1.0 regardless of age.
pub fn recency_multiplier(age_days: f64) -> f64 {
    (-age_days * std::f64::consts::LN_2 / 30.0).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_scores_pure_lexical_when_no_vector() {
        let lex = vec![("a".to_string(), 0.5), ("b".to_string(), 1.0)];
        let fused = fuse_scores(&lex, &[], 0.7);
        assert!(fused["b"] > fused["a"]);
    }

    #[test]
    fn test_fuse_scores_respects_weight() {
        let lex = vec![("a".to_string(), 1.0), ("b".to_string(), 0.0)];
        let vec_scores = vec![("a".to_string(), 0.0), ("b".to_string(), 1.0)];
        // weight 0 -> pure lexical, a wins
        let fused_lex = fuse_scores(&lex, &vec_scores, 0.0);
        assert!(fused_lex["a"] > fused_lex["b"]);
        // weight 1 -> pure vector, b wins
        let fused_vec = fuse_scores(&lex, &vec_scores, 1.0);
        assert!(fused_vec["b"] > fused_vec["a"]);
    }

    #[test]
    fn test_diversity_cap_limits_per_file() {
        let candidates = vec![
            ScoredCandidate {
                id: "1".into(),
                score: 0.9,
                file_path: Some("src/a.py".into()),
                access_count: 0,
                created_at_unix: 0,
                tie_break_id: 1,
            },
            ScoredCandidate {
                id: "2".into(),
                score: 0.8,
                file_path: Some("src/a.py".into()),
                access_count: 0,
                created_at_unix: 0,
                tie_break_id: 2,
            },
            ScoredCandidate {
                id: "3".into(),
                score: 0.7,
                file_path: Some("src/a.py".into()),
                access_count: 0,
                created_at_unix: 0,
                tie_break_id: 3,
            },
            ScoredCandidate {
                id: "4".into(),
                score: 0.6,
                file_path: Some("src/b.py".into()),
                access_count: 0,
                created_at_unix: 0,
                tie_break_id: 4,
            },
        ];
        let capped = apply_diversity_cap(candidates, 2);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped.iter().filter(|c| c.file_path.as_deref() == Some("src/a.py")).count(), 2);
    }

    #[test]
    fn test_sort_with_tiebreak_prefers_access_count_then_id() {
        let mut candidates = vec![
            ScoredCandidate {
                id: "a".into(),
                score: 0.5,
                file_path: None,
                access_count: 1,
                created_at_unix: 100,
                tie_break_id: 2,
            },
            ScoredCandidate {
                id: "b".into(),
                score: 0.5,
                file_path: None,
                access_count: 5,
                created_at_unix: 50,
                tie_break_id: 1,
            },
        ];
        sort_with_tiebreak(&mut candidates);
        assert_eq!(candidates[0].id, "b");
    }

    #[test]
    fn test_recency_multiplier_at_zero_days_is_one() {
        assert!((recency_multiplier(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_multiplier_decays() {
        let thirty_days = recency_multiplier(30.0);
        // half-life at 30 days with lambda = ln(2)/30
        assert!((thirty_days - 0.5).abs() < 0.01);
    }
}
