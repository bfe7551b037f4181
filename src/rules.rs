//! Rule engine: stores rules with natural-language triggers and matches
//! action descriptions against them via the same hybrid-search machinery
//! the memory manager uses for recall.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::analyzer::analyze;
use crate::error::{EngineError, Result};
use crate::lexical::{LexicalDocument, LexicalIndex};
use crate::storage::{RuleRow, Storage};

const DEFAULT_MATCH_THRESHOLD: f32 = 0.35;
const DEFAULT_MAX_MATCHES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleInput {
    pub trigger: String,
    #[serde(default)]
    pub must_do: Vec<String>,
    #[serde(default)]
    pub must_not: Vec<String>,
    #[serde(default)]
    pub ask_first: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: i64,
    pub trigger: String,
    pub keywords: Vec<String>,
    pub must_do: Vec<String>,
    pub must_not: Vec<String>,
    pub ask_first: Vec<String>,
    pub warnings: Vec<String>,
    pub priority: i64,
    pub enabled: bool,
}

/// The result of `check_rules`: every matched rule's guidance, aggregated
/// into the four lists, each item retaining the source rule id it came from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatches {
    pub matched_rule_ids: Vec<i64>,
    pub must_do: Vec<GuidanceItem>,
    pub must_not: Vec<GuidanceItem>,
    pub ask_first: Vec<GuidanceItem>,
    pub warnings: Vec<GuidanceItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceItem {
    pub text: String,
    pub rule_id: i64,
}

pub struct RuleEngine<'a> {
    storage: &'a Storage,
    lexical: Mutex<LexicalIndex>,
    match_threshold: f32,
    max_matches: usize,
}

impl<'a> RuleEngine<'a> {
    pub fn new(storage: &'a Storage) -> Result<Self> {
        Self::with_threshold(storage, DEFAULT_MATCH_THRESHOLD, DEFAULT_MAX_MATCHES)
    }

    pub fn with_threshold(storage: &'a Storage, match_threshold: f32, max_matches: usize) -> Result<Self> {
        let rows = storage.list_rules(false)?;
        let mut lexical = LexicalIndex::new();
        for row in &rows {
            lexical.upsert(&row.id.to_string(), &rule_document(&row));
        }
        Ok(Self { storage, lexical: Mutex::new(lexical), match_threshold, max_matches })
    }

    pub fn add_rule(&self, input: RuleInput) -> Result<i64> {
        if input.trigger.trim().is_empty() {
            return Err(EngineError::InvalidInput("rule trigger must not be empty".into()));
        }
        let keywords: Vec<String> = analyze(&input.trigger).keywords.into_iter().collect();
        let id = self.storage.insert_rule(
            &input.trigger,
            &serde_json::to_string(&keywords)?,
            &serde_json::to_string(&input.must_do)?,
            &serde_json::to_string(&input.must_not)?,
            &serde_json::to_string(&input.ask_first)?,
            &serde_json::to_string(&input.warnings)?,
            input.priority,
        )?;
        if let Some(row) = self.storage.get_rule(id)? {
            self.index_row(&row);
        }
        Ok(id)
    }

    pub fn update_rule(&self, id: i64, input: RuleInput) -> Result<()> {
        if input.trigger.trim().is_empty() {
            return Err(EngineError::InvalidInput("rule trigger must not be empty".into()));
        }
        let keywords: Vec<String> = analyze(&input.trigger).keywords.into_iter().collect();
        self.storage.update_rule(
            id,
            &input.trigger,
            &serde_json::to_string(&keywords)?,
            &serde_json::to_string(&input.must_do)?,
            &serde_json::to_string(&input.must_not)?,
            &serde_json::to_string(&input.ask_first)?,
            &serde_json::to_string(&input.warnings)?,
            input.priority,
        )?;
        if let Some(row) = self.storage.get_rule(id)? {
            self.index_row(&row);
        }
        Ok(())
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.storage.set_rule_enabled(id, enabled)
    }

    pub fn delete_rule(&self, id: i64) -> Result<()> {
        self.storage.delete_rule(id)?;
        if let Ok(mut lexical) = self.lexical.lock() {
            lexical.remove(&id.to_string());
        }
        Ok(())
    }

    pub fn list_rules(&self, enabled_only: bool) -> Result<Vec<Rule>> {
        self.storage.list_rules(enabled_only)?.into_iter().map(rule_from_row).collect()
    }

    fn index_row(&self, row: &RuleRow) {
        if let Ok(mut lexical) = self.lexical.lock() {
            lexical.upsert(&row.id.to_string(), &rule_document(row));
        }
    }

    /// Match `action` (optionally with extra `context`) against enabled
    /// rule triggers, keeping matches scoring above the configured
    /// threshold, ranked `priority DESC, score DESC`, deduplicated, and
    /// capped at `max_matches`.
    pub fn check_rules(&self, action: &str, context: Option<&str>) -> Result<RuleMatches> {
        let query = match context {
            Some(ctx) => format!("{action} {ctx}"),
            None => action.to_string(),
        };
        let hits = self
            .lexical
            .lock()
            .map_err(|_| EngineError::Internal("rule lexical index lock poisoned".into()))?
            .search(&query, self.max_matches * 4);

        let enabled = self.storage.list_rules(true)?;
        let by_id: HashMap<i64, RuleRow> = enabled.into_iter().map(|r| (r.id, r)).collect();

        let mut scored: Vec<(RuleRow, f32)> = hits
            .into_iter()
            .filter_map(|(id_str, score)| {
                let id: i64 = id_str.parse().ok()?;
                let row = by_id.get(&id)?.clone();
                (score >= self.match_threshold).then_some((row, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.priority
                .cmp(&a.0.priority)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        scored.truncate(self.max_matches);

        let mut result = RuleMatches::default();
        for (row, _score) in scored {
            result.matched_rule_ids.push(row.id);
            append_guidance(&mut result.must_do, &row.must_do_json, row.id);
            append_guidance(&mut result.must_not, &row.must_not_json, row.id);
            append_guidance(&mut result.ask_first, &row.ask_first_json, row.id);
            append_guidance(&mut result.warnings, &row.warnings_json, row.id);
        }
        Ok(result)
    }
}

fn append_guidance(out: &mut Vec<GuidanceItem>, list_json: &str, rule_id: i64) {
    let list: Vec<String> = serde_json::from_str(list_json).unwrap_or_default();
    out.extend(list.into_iter().map(|text| GuidanceItem { text, rule_id }));
}

fn rule_document(row: &RuleRow) -> LexicalDocument {
    let keywords: Vec<String> = serde_json::from_str(&row.keywords_json).unwrap_or_default();
    LexicalDocument {
        content: format!("{} {}", row.trigger, keywords.join(" ")),
        rationale: String::new(),
        context: String::new(),
        tags: Vec::new(),
        file_path: None,
        category: "rule".to_string(),
    }
}

fn rule_from_row(row: RuleRow) -> Result<Rule> {
    Ok(Rule {
        id: row.id,
        trigger: row.trigger,
        keywords: serde_json::from_str(&row.keywords_json)?,
        must_do: serde_json::from_str(&row.must_do_json)?,
        must_not: serde_json::from_str(&row.must_not_json)?,
        ask_first: serde_json::from_str(&row.ask_first_json)?,
        warnings: serde_json::from_str(&row.warnings_json)?,
        priority: row.priority,
        enabled: row.enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(storage: &Storage) -> RuleEngine<'_> {
        RuleEngine::new(storage).unwrap()
    }

    fn input(trigger: &str, must_not: &[&str]) -> RuleInput {
        RuleInput {
            trigger: trigger.to_string(),
            must_not: must_not.iter().map(|s| s.to_string()).collect(),
            priority: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_add_rule_rejects_empty_trigger() {
        let storage = Storage::open_in_memory().unwrap();
        let engine = engine(&storage);
        let err = engine.add_rule(RuleInput::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_check_rules_matches_above_threshold() {
        let storage = Storage::open_in_memory().unwrap();
        let engine = engine(&storage);
        engine
            .add_rule(input("deleting production database tables", &["never drop a table without a backup"]))
            .unwrap();

        let matches = engine.check_rules("deleting production database tables", None).unwrap();
        assert_eq!(matches.matched_rule_ids.len(), 1);
        assert_eq!(matches.must_not.len(), 1);
    }

    #[test]
    fn test_check_rules_ignores_disabled() {
        let storage = Storage::open_in_memory().unwrap();
        let engine = engine(&storage);
        let id = engine.add_rule(input("rotating api keys", &["revoke the old key first"])).unwrap();
        engine.set_enabled(id, false).unwrap();

        let matches = engine.check_rules("rotating api keys", None).unwrap();
        assert!(matches.matched_rule_ids.is_empty());
    }

    #[test]
    fn test_check_rules_ranks_by_priority_then_score() {
        let storage = Storage::open_in_memory().unwrap();
        let engine = engine(&storage);
        engine.add_rule(RuleInput { trigger: "refactoring the auth module".into(), priority: 5, ..Default::default() }).unwrap();
        engine.add_rule(RuleInput { trigger: "refactoring the auth module carefully".into(), priority: 10, ..Default::default() }).unwrap();

        let matches = engine.check_rules("refactoring the auth module", None).unwrap();
        assert_eq!(matches.matched_rule_ids.len(), 2);
    }

    #[test]
    fn test_update_rule_reindexes_trigger() {
        let storage = Storage::open_in_memory().unwrap();
        let engine = engine(&storage);
        let id = engine.add_rule(input("old trigger text", &[])).unwrap();
        engine.update_rule(id, input("brand new trigger about caching layers", &["invalidate before writing"])).unwrap();

        let matches = engine.check_rules("brand new trigger about caching layers", None).unwrap();
        assert_eq!(matches.matched_rule_ids, vec![id]);
    }
}
