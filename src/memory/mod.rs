//! Memory data model: the typed observation at the heart of the engine.
//!
//! See [`manager`] for the `MemoryManager` that implements record/recall/
//! seal_outcome/pin/archive/compact/prune/cleanup_duplicates.

pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::MemoryManager;

/// The four closed categories of stored knowledge. Decay and permanence
/// policy are methods on this variant rather than on separate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Decision,
    Pattern,
    Warning,
    Learning,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Decision => "decision",
            Category::Pattern => "pattern",
            Category::Warning => "warning",
            Category::Learning => "learning",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "decision" => Some(Category::Decision),
            "pattern" => Some(Category::Pattern),
            "warning" => Some(Category::Warning),
            "learning" => Some(Category::Learning),
            _ => None,
        }
    }

    /// Patterns and warnings default to permanent (never decay, never
    /// pruned by age); decisions and learnings decay and are prune
    /// candidates once old enough.
    pub fn default_permanent(&self) -> bool {
        matches!(self, Category::Pattern | Category::Warning)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The recorded outcome of a decision or learning: whether the approach
/// worked, in the caller's words.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub description: String,
    pub worked: bool,
    pub sealed_at: DateTime<Utc>,
}

/// A typed observation: a decision, pattern, warning, or learning.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: i64,
    pub category: Category,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub is_permanent: bool,
    pub is_pinned: bool,
    pub is_archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// True when this memory was sourced from the global cross-project
    /// partition rather than the operating project.
    #[serde(default)]
    pub from_global: bool,
}

impl Memory {
    /// Age in fractional days since creation, evaluated against `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0
    }

    /// Whether recency decay applies: skipped for permanent or pinned
    /// memories, which always carry a 1.0 recency multiplier.
    pub fn skips_recency(&self) -> bool {
        self.is_permanent || self.is_pinned
    }

    /// The outcome-boost multiplier: 1.5 for worked=false (promoted, not
    /// hidden), 1.2 for worked=true, 1.0 when unsealed.
    pub fn outcome_multiplier(&self) -> f64 {
        match &self.outcome {
            Some(o) if !o.worked => 1.5,
            Some(o) if o.worked => 1.2,
            _ => 1.0,
        }
    }
}

/// Caller-supplied input for `record`. Uses `deny_unknown_fields` so a
/// malformed or injected extra field is rejected rather than silently
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordInput {
    pub category: String,
    pub content: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub is_permanent: Option<bool>,
}

/// Filters accepted by `recall` / `find_code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecallFilters {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub exclude_archived: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub condensed: bool,
    /// Soft file-scope signal, distinct from `file_path`: memories whose
    /// `file_path` matches this one are boosted rather than the result set
    /// being restricted to them. Used by composite operations that reason
    /// about "what's relevant here" without discarding everything else.
    #[serde(default)]
    pub focus_file: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    10
}

impl Default for RecallFilters {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            file_path: None,
            tags: Vec::new(),
            exclude_archived: true,
            limit: default_limit(),
            condensed: false,
            focus_file: None,
        }
    }
}

impl RecallFilters {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// One scored search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub score: f32,
}

/// `recall`'s grouped-by-category response, plus the degradation flag
/// from the retrieval pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResult {
    pub by_category: std::collections::BTreeMap<String, Vec<ScoredMemory>>,
    pub vector_unavailable: bool,
}

/// Result of a `record` call, including any conflict candidates found
/// during conflict detection. The record still succeeds when conflicts
/// are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub id: i64,
    pub conflicts: Vec<ConflictCandidate>,
}

/// A memory whose content plausibly contradicts the just-recorded one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCandidate {
    pub memory_id: i64,
    pub similarity: f32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_roundtrip() {
        for cat in [
            Category::Decision,
            Category::Pattern,
            Category::Warning,
            Category::Learning,
        ] {
            assert_eq!(Category::parse_name(cat.as_str()), Some(cat));
        }
    }

    #[test]
    fn test_category_default_permanence() {
        assert!(Category::Pattern.default_permanent());
        assert!(Category::Warning.default_permanent());
        assert!(!Category::Decision.default_permanent());
        assert!(!Category::Learning.default_permanent());
    }

    #[test]
    fn test_outcome_multiplier_boundaries() {
        let base = Memory {
            id: 1,
            category: Category::Decision,
            content: "x".into(),
            rationale: None,
            context: None,
            tags: vec![],
            keywords: vec![],
            file_path: None,
            is_permanent: false,
            is_pinned: false,
            is_archived: false,
            outcome: None,
            access_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            from_global: false,
        };
        assert!((base.outcome_multiplier() - 1.0).abs() < 1e-9);

        let mut failed = base.clone();
        failed.outcome = Some(Outcome {
            description: "didn't work".into(),
            worked: false,
            sealed_at: Utc::now(),
        });
        assert!((failed.outcome_multiplier() - 1.5).abs() < 1e-9);

        let mut worked = base.clone();
        worked.outcome = Some(Outcome {
            description: "worked".into(),
            worked: true,
            sealed_at: Utc::now(),
        });
        assert!((worked.outcome_multiplier() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_record_input_deny_unknown_fields() {
        let json = r#"{"category": "decision", "content": "test"}"#;
        let parsed: Result<RecordInput, _> = serde_json::from_str(json);
        assert!(parsed.is_ok());

        let bad = r#"{"category": "decision", "content": "test", "evil": true}"#;
        let parsed: Result<RecordInput, _> = serde_json::from_str(bad);
        assert!(parsed.is_err());
    }
}
