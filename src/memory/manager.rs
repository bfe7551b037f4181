//! `MemoryManager`: record/recall/seal_outcome/pin/archive/prune/
//! cleanup_duplicates/vacuum_and_reindex over one project's (or the global
//! partition's) storage, lexical index, and optional vector index.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lru::LruCache;

use crate::analyzer::{analyze, infer_tags};
use crate::collaborators::Embedder;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lexical::{LexicalDocument, LexicalIndex};
use crate::search::{apply_diversity_cap, fuse_scores, recency_multiplier, sort_with_tiebreak, ScoredCandidate};
use crate::storage::{MemoryRow, NewMemoryRow, Storage};

#[cfg(feature = "vector-search")]
use crate::vector::{VectorIndex, VectorIndexConfig};

use super::{Category, ConflictCandidate, Memory, Outcome, RecallFilters, RecallResult, RecordInput, RecordResult, ScoredMemory};

/// `detect_conflicts` has no caller-supplied result limit to derive a pool
/// from (unlike `recall`), so it scans as if asked for this many results.
const CONFLICT_SCAN_LIMIT: usize = 16;
const QUERY_EMBEDDING_CACHE_SIZE: usize = 100;
/// Extra multiplier for pinned memories, on top of the recency-skip they
/// already get: pinning means "keep surfacing this," not just "don't decay
/// it."
const PIN_BOOST: f64 = 1.25;
/// Extra multiplier for memories whose `file_path` matches `focus_file`.
const FILE_SCOPE_BOOST: f64 = 1.4;
/// Negation markers used by the conflict heuristic: a new memory sharing a
/// high-similarity neighbor but disagreeing on negation polarity is flagged,
/// not silently accepted.
const NEGATION_MARKERS: &[&str] = &["not", "never", "avoid", "don't", "stop", "no longer"];

pub struct MemoryManager {
    storage: Storage,
    lexical: Mutex<LexicalIndex>,
    #[cfg(feature = "vector-search")]
    vector: Option<Mutex<VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    config: EngineConfig,
}

impl MemoryManager {
    /// Open `storage`, rebuilding the lexical (and, if an embedder is
    /// configured, vector) index from every non-deleted memory row. The
    /// embedder is shared (`Arc`) rather than owned so the same loaded model
    /// can back both the project and global partitions' managers.
    pub fn new(storage: Storage, config: EngineConfig, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let rows = storage.list_memories(true)?;

        let mut lexical = LexicalIndex::new();
        for row in &rows {
            lexical.upsert(&row.id.to_string(), &lexical_document(row));
        }

        #[cfg(feature = "vector-search")]
        let vector = if let Some(embedder) = embedder.as_ref() {
            let index = VectorIndex::with_config(VectorIndexConfig::with_dimensions(embedder.dimension()))
                .map_err(|e| EngineError::BackendError(e.to_string()))?;
            Some(Mutex::new(index))
        } else {
            None
        };

        let manager = Self {
            storage,
            lexical: Mutex::new(lexical),
            #[cfg(feature = "vector-search")]
            vector,
            embedder,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_EMBEDDING_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            config,
        };

        Ok(manager)
    }

    /// The backing storage handle, for callers (the composite-operations
    /// facade) that need to compose a `Graph` over the same database.
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Whether hybrid retrieval actually has a vector leg right now, for
    /// `health` diagnostics.
    pub(crate) fn vector_search_available(&self) -> bool {
        #[cfg(feature = "vector-search")]
        {
            self.vector.is_some() && self.embedder.is_some()
        }
        #[cfg(not(feature = "vector-search"))]
        {
            false
        }
    }

    fn embed_cached(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        if let Some(cached) = self.query_cache.lock().ok()?.get(text) {
            return Some(cached.clone());
        }
        let embedding = embedder.embed(text).ok()?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(text.to_string(), embedding.clone());
        }
        Some(embedding)
    }

    // -- record ----------------------------------------------------------

    pub fn record(&self, input: RecordInput) -> Result<RecordResult> {
        let category = Category::parse_name(&input.category)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown category: {}", input.category)))?;

        let tags = infer_tags(&input.content, category.as_str(), &input.tags);
        let combined_text = format!(
            "{} {} {}",
            input.content,
            input.rationale.as_deref().unwrap_or(""),
            input.context.as_deref().unwrap_or("")
        );
        let keywords: Vec<String> = analyze(&combined_text).keywords.into_iter().collect();
        let is_permanent = input.is_permanent.unwrap_or(category.default_permanent());

        let conflicts = self.detect_conflicts(&input.content, category, input.file_path.as_deref())?;

        let new_row = NewMemoryRow {
            category: category.as_str().to_string(),
            content: input.content.clone(),
            rationale: input.rationale.clone(),
            context: input.context.clone(),
            tags_json: serde_json::to_string(&tags)?,
            keywords_json: serde_json::to_string(&keywords)?,
            file_path: input.file_path.clone(),
            is_permanent,
        };
        let id = self.storage.insert_memory(&new_row)?;

        let row = self
            .storage
            .get_memory(id)?
            .ok_or_else(|| EngineError::Internal(format!("memory {id} vanished after insert")))?;
        self.index_row(&row);

        Ok(RecordResult { id, conflicts })
    }

    fn index_row(&self, row: &MemoryRow) {
        if let Ok(mut lexical) = self.lexical.lock() {
            lexical.upsert(&row.id.to_string(), &lexical_document(row));
        }
        #[cfg(feature = "vector-search")]
        if let Some(vector) = &self.vector {
            if let Some(embedder) = &self.embedder {
                let text = format!(
                    "{} {} {}",
                    row.content,
                    row.rationale.as_deref().unwrap_or(""),
                    row.context.as_deref().unwrap_or("")
                );
                if let Ok(embedding) = embedder.embed(&text) {
                    if let Ok(mut vector) = vector.lock() {
                        let _ = vector.add(&row.id.to_string(), &embedding);
                    }
                }
            }
        }
    }

    /// Find memories that plausibly contradict `content`: similarity above
    /// the configured threshold, and either (a) a decision/warning pair
    /// sharing the same file, or (b) same-category memories with
    /// disagreeing negation polarity (one says "use X", the other says
    /// "don't use X") as a proxy for opposite tags.
    fn detect_conflicts(
        &self,
        content: &str,
        category: Category,
        file_path: Option<&str>,
    ) -> Result<Vec<ConflictCandidate>> {
        if !matches!(category, Category::Decision | Category::Warning) {
            return Ok(Vec::new());
        }
        let candidates = self.fused_candidates(content, (CONFLICT_SCAN_LIMIT * 4).max(CONFLICT_SCAN_LIMIT))?;
        let lower_new = content.to_lowercase();
        let new_has_negation = NEGATION_MARKERS.iter().any(|m| lower_new.contains(m));

        let mut conflicts = Vec::new();
        for (id_str, score) in candidates {
            if score < self.config.conflict_similarity_threshold {
                continue;
            }
            let Ok(id) = id_str.parse::<i64>() else { continue };
            let Some(row) = self.storage.get_memory(id)? else { continue };
            if row.is_archived {
                continue;
            }

            let cross_category_same_file = matches!(
                (category, row.category.as_str()),
                (Category::Decision, "warning") | (Category::Warning, "decision")
            ) && file_path.is_some()
                && row.file_path.as_deref() == file_path;

            let other_has_negation = NEGATION_MARKERS.iter().any(|m| row.content.to_lowercase().contains(m));
            let opposite_tags = row.category == category.as_str() && new_has_negation != other_has_negation;

            if !cross_category_same_file && !opposite_tags {
                continue;
            }

            conflicts.push(ConflictCandidate {
                memory_id: id,
                similarity: score,
                reason: if cross_category_same_file {
                    format!("{} conflicts with {} #{id} on the same file", category.as_str(), row.category)
                } else {
                    format!("disagrees with memory #{id} on the same topic")
                },
            });
        }
        Ok(conflicts)
    }

    /// Hybrid lexical+vector candidate fusion, independent of filters. If
    /// the in-memory TF-IDF index's lock is poisoned (a writer panicked
    /// mid-update), lexical scoring degrades to the FTS5 `memories_fts`
    /// shadow table instead of failing the whole call — the crash-safe
    /// fallback that table and its sync triggers exist for.
    fn fused_candidates(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        let lexical_hits = match self.lexical.lock() {
            Ok(index) => index.search(query, limit),
            Err(_) => {
                tracing::warn!("in-memory lexical index lock poisoned; falling back to FTS5 keyword search");
                self.storage
                    .keyword_search_memories(query, limit)?
                    .into_iter()
                    .map(|(id, score)| (id.to_string(), score))
                    .collect()
            }
        };

        #[cfg(feature = "vector-search")]
        let vector_hits = if self.vector_search_available() {
            if let (Some(vector), Some(query_vec)) = (&self.vector, self.embed_cached(query)) {
                vector
                    .lock()
                    .map_err(|_| EngineError::Internal("vector index lock poisoned".into()))?
                    .search(&query_vec, limit)
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };
        #[cfg(not(feature = "vector-search"))]
        let vector_hits: Vec<(String, f32)> = Vec::new();

        let fused = fuse_scores(&lexical_hits, &vector_hits, self.config.hybrid_vector_weight);
        let mut results: Vec<(String, f32)> = fused.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    // -- recall ------------------------------------------------------------

    pub fn recall(&self, query: &str, filters: RecallFilters) -> Result<RecallResult> {
        let now = Utc::now();
        let candidates = if query.trim().is_empty() {
            self.unranked_candidates(&filters)?
        } else {
            self.fused_candidates(query, (filters.limit * 4).max(filters.limit))?
        };

        let mut scored = Vec::new();
        for (id_str, base_score) in candidates {
            let Ok(id) = id_str.parse::<i64>() else { continue };
            let Some(row) = self.storage.get_memory(id)? else { continue };
            if !self.passes_filters(&row, &filters) {
                continue;
            }
            let memory = memory_from_row(row, false);
            let recency = if memory.skips_recency() { 1.0 } else { recency_multiplier(memory.age_days(now)) };
            let pin_boost = if memory.is_pinned { PIN_BOOST } else { 1.0 };
            let file_boost = if filters.focus_file.is_some() && memory.file_path == filters.focus_file {
                FILE_SCOPE_BOOST
            } else {
                1.0
            };
            let adjusted = base_score as f64 * recency * memory.outcome_multiplier() * pin_boost * file_boost;
            scored.push((memory, adjusted as f32));
        }

        let mut candidates: Vec<ScoredCandidate> = scored
            .iter()
            .map(|(memory, score)| ScoredCandidate {
                id: memory.id.to_string(),
                score: *score,
                file_path: memory.file_path.clone(),
                access_count: memory.access_count,
                created_at_unix: memory.created_at.timestamp(),
                tie_break_id: memory.id,
            })
            .collect();
        sort_with_tiebreak(&mut candidates);
        let capped = apply_diversity_cap(candidates, self.config.search_diversity_max_per_file);

        let by_score: std::collections::HashMap<String, f32> =
            capped.iter().map(|c| (c.id.clone(), c.score)).collect();
        let memories: std::collections::HashMap<i64, Memory> =
            scored.into_iter().map(|(m, _)| (m.id, m)).collect();

        let mut result = RecallResult {
            vector_unavailable: !self.vector_search_available(),
            ..Default::default()
        };

        let mut accessed = Vec::new();
        for candidate in &capped {
            let Ok(id) = candidate.id.parse::<i64>() else { continue };
            let Some(memory) = memories.get(&id) else { continue };
            accessed.push(id);
            let score = *by_score.get(&candidate.id).unwrap_or(&0.0);
            let mut memory = memory.clone();
            if filters.condensed {
                condense(&mut memory);
            }
            result
                .by_category
                .entry(memory.category.as_str().to_string())
                .or_default()
                .push(ScoredMemory { memory, score });
            if result.by_category.values().map(|v| v.len()).sum::<usize>() >= filters.limit {
                break;
            }
        }
        self.storage.increment_access_count(&accessed)?;
        Ok(result)
    }

    fn unranked_candidates(&self, filters: &RecallFilters) -> Result<Vec<(String, f32)>> {
        let rows = if let Some(file_path) = &filters.file_path {
            self.storage.list_memories_for_file(file_path)?
        } else {
            self.storage.list_memories(!filters.exclude_archived)?
        };
        Ok(rows.into_iter().map(|row| (row.id.to_string(), 1.0)).collect())
    }

    fn passes_filters(&self, row: &MemoryRow, filters: &RecallFilters) -> bool {
        if filters.exclude_archived && row.is_archived {
            return false;
        }
        if !filters.categories.is_empty() && !filters.categories.iter().any(|c| c.eq_ignore_ascii_case(&row.category)) {
            return false;
        }
        if let Some(file_path) = &filters.file_path {
            if row.file_path.as_deref() != Some(file_path.as_str()) {
                return false;
            }
        }
        if !filters.tags.is_empty() {
            let row_tags: Vec<String> = serde_json::from_str(&row.tags_json).unwrap_or_default();
            if !filters.tags.iter().any(|t| row_tags.contains(t)) {
                return false;
            }
        }
        true
    }

    pub fn recall_for_file(&self, file_path: &str) -> Result<Vec<Memory>> {
        let now = Utc::now();
        let mut rows = self.storage.list_memories_for_file(file_path)?;
        rows.sort_by(|a, b| {
            let a_memory = memory_from_row(a.clone(), false);
            let b_memory = memory_from_row(b.clone(), false);
            let a_score = if a_memory.skips_recency() { 1.0 } else { recency_multiplier(a_memory.age_days(now)) };
            let b_score = if b_memory.skips_recency() { 1.0 } else { recency_multiplier(b_memory.age_days(now)) };
            b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows.into_iter().map(|r| memory_from_row(r, false)).collect())
    }

    pub fn find_related(&self, memory_id: i64, limit: usize) -> Result<Vec<ScoredMemory>> {
        let row = self
            .storage
            .get_memory(memory_id)?
            .ok_or_else(|| EngineError::NotFound(format!("memory {memory_id}")))?;
        let candidates = self.fused_candidates(&row.content, limit + 1)?;
        let mut related = Vec::new();
        for (id_str, score) in candidates {
            let Ok(id) = id_str.parse::<i64>() else { continue };
            if id == memory_id {
                continue;
            }
            if let Some(other) = self.storage.get_memory(id)? {
                if other.is_archived {
                    continue;
                }
                related.push(ScoredMemory { memory: memory_from_row(other, false), score });
            }
            if related.len() >= limit {
                break;
            }
        }
        Ok(related)
    }

    // -- lifecycle operations ----------------------------------------------

    pub fn pin(&self, id: i64, pinned: bool) -> Result<()> {
        self.storage.set_pinned(id, pinned)
    }

    pub fn archive(&self, id: i64, archived: bool) -> Result<()> {
        self.storage.set_archived(id, archived)
    }

    pub fn seal_outcome(&self, id: i64, description: &str, worked: bool) -> Result<()> {
        self.storage.seal_outcome(id, description, worked)
    }

    /// Re-embed and re-index every memory from scratch.
    pub fn rebuild_index(&self) -> Result<usize> {
        let rows = self.storage.list_memories(true)?;
        {
            let mut lexical = self
                .lexical
                .lock()
                .map_err(|_| EngineError::Internal("lexical index lock poisoned".into()))?;
            lexical.clear();
        }
        #[cfg(feature = "vector-search")]
        if let Some(vector) = &self.vector {
            if let Ok(mut vector) = vector.lock() {
                if let Ok(fresh) = VectorIndex::with_config(VectorIndexConfig::with_dimensions(vector.dimensions())) {
                    *vector = fresh;
                }
            }
        }
        for row in &rows {
            self.index_row(row);
        }
        Ok(rows.len())
    }

    /// VACUUM the backing database and rebuild in-memory indices. Restricted
    /// to the project's own storage handle: callers never run this against
    /// the global partition's `MemoryManager`. This is routine maintenance,
    /// distinct from the `compact` operation in [`crate::engine`] that
    /// summarizes episodic memories into a checkpoint.
    pub fn vacuum_and_reindex(&self) -> Result<usize> {
        self.storage.vacuum()?;
        self.rebuild_index()
    }

    /// Remove memories satisfying every protective predicate in
    /// [`PruneOptions`]. Returns the ids removed (or, if `dry_run`, the ids
    /// that would be removed). Pattern/warning/pinned memories are never
    /// candidates regardless of options, per `skips_recency`.
    pub fn prune(&self, options: PruneOptions) -> Result<Vec<i64>> {
        let now = Utc::now();
        let rows = self.storage.list_memories(true)?;
        let mut candidates = Vec::new();
        for row in rows {
            if !options.categories.is_empty() && !options.categories.iter().any(|c| c.eq_ignore_ascii_case(&row.category)) {
                continue;
            }
            let memory = memory_from_row(row, false);
            if memory.skips_recency() {
                continue;
            }
            if memory.access_count as usize >= options.min_recall_count {
                continue;
            }
            if options.protect_successful {
                if let Some(outcome) = &memory.outcome {
                    if outcome.worked {
                        continue;
                    }
                }
            }
            if memory.age_days(now) >= options.older_than_days {
                candidates.push(memory.id);
            }
        }
        if !options.dry_run {
            for id in &candidates {
                self.storage.delete_memory(*id)?;
                if let Ok(mut lexical) = self.lexical.lock() {
                    lexical.remove(&id.to_string());
                }
                #[cfg(feature = "vector-search")]
                if let Some(vector) = &self.vector {
                    if let Ok(mut vector) = vector.lock() {
                        let _ = vector.remove(&id.to_string());
                    }
                }
            }
        }
        Ok(candidates)
    }

    /// Merge exact duplicates: memories sharing (category, normalized
    /// content, file_path). The newest (highest id) survives; older
    /// duplicates are deleted after merging outcomes into the survivor
    /// (a sealed outcome is preferred over an unsealed one) and migrating
    /// their incoming edges so no edge is left dangling.
    pub fn cleanup_duplicates(&self, dry_run: bool) -> Result<usize> {
        let rows = self.storage.list_memories(false)?;
        let mut groups: std::collections::HashMap<(String, String, Option<String>), Vec<MemoryRow>> =
            std::collections::HashMap::new();
        for row in rows {
            let key = (row.category.clone(), normalize_content(&row.content), row.file_path.clone());
            groups.entry(key).or_default().push(row);
        }

        let mut removed = 0;
        for (_, mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            group.sort_by_key(|r| r.id);
            let survivor = group.pop().expect("group has at least 2 rows");
            let survivor_has_outcome = survivor.outcome.is_some();

            for duplicate in group {
                if dry_run {
                    removed += 1;
                    continue;
                }
                if !survivor_has_outcome {
                    if let (Some(desc), Some(worked)) = (&duplicate.outcome, duplicate.worked) {
                        self.storage.seal_outcome(survivor.id, desc, worked)?;
                    }
                }
                for edge in self.storage.edges_touching(duplicate.id)? {
                    let (src, dst) = if edge.source_id == duplicate.id {
                        (survivor.id, edge.target_id)
                    } else {
                        (edge.source_id, survivor.id)
                    };
                    if src != dst {
                        let _ = self.storage.insert_edge(src, dst, &edge.relationship, edge.description.as_deref(), edge.confidence);
                    }
                }
                self.storage.delete_memory(duplicate.id)?;
                if let Ok(mut lexical) = self.lexical.lock() {
                    lexical.remove(&duplicate.id.to_string());
                }
                #[cfg(feature = "vector-search")]
                if let Some(vector) = &self.vector {
                    if let Ok(mut vector) = vector.lock() {
                        let _ = vector.remove(&duplicate.id.to_string());
                    }
                }
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Options for [`MemoryManager::prune`]. Defaults: 90-day age threshold,
/// every category eligible, never protect on access count alone, and
/// protect memories whose outcome worked.
#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub older_than_days: f64,
    pub categories: Vec<String>,
    pub min_recall_count: usize,
    pub protect_successful: bool,
    pub dry_run: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            older_than_days: 90.0,
            categories: Vec::new(),
            min_recall_count: usize::MAX,
            protect_successful: true,
            dry_run: true,
        }
    }
}

/// Lowercased, whitespace-collapsed content used to detect exact
/// duplicates independent of incidental punctuation/case differences.
fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

const CONDENSED_CONTENT_CHARS: usize = 140;

/// Truncate the prose fields of a memory for summary views (`briefing`,
/// `propose_refactor`) where full rationale/context would be noise.
pub(crate) fn condense(memory: &mut Memory) {
    memory.content = memory.content.chars().take(CONDENSED_CONTENT_CHARS).collect();
    memory.rationale = None;
    memory.context = None;
}

fn lexical_document(row: &MemoryRow) -> LexicalDocument {
    let tags: Vec<String> = serde_json::from_str(&row.tags_json).unwrap_or_default();
    LexicalDocument {
        content: row.content.clone(),
        rationale: row.rationale.clone().unwrap_or_default(),
        context: row.context.clone().unwrap_or_default(),
        tags,
        file_path: row.file_path.clone(),
        category: row.category.clone(),
    }
}

pub(crate) fn memory_from_row(row: MemoryRow, from_global: bool) -> Memory {
    let tags: Vec<String> = serde_json::from_str(&row.tags_json).unwrap_or_default();
    let keywords: Vec<String> = serde_json::from_str(&row.keywords_json).unwrap_or_default();
    let outcome = row.outcome.map(|description| Outcome {
        description,
        worked: row.worked.unwrap_or(false),
        sealed_at: row.outcome_sealed_at.unwrap_or(row.updated_at),
    });
    Memory {
        id: row.id,
        category: Category::parse_name(&row.category).unwrap_or(Category::Learning),
        content: row.content,
        rationale: row.rationale,
        context: row.context,
        tags,
        keywords,
        file_path: row.file_path,
        is_permanent: row.is_permanent,
        is_pinned: row.is_pinned,
        is_archived: row.is_archived,
        outcome,
        access_count: row.access_count,
        created_at: row.created_at,
        updated_at: row.updated_at,
        from_global,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        let storage = Storage::open_in_memory().unwrap();
        MemoryManager::new(storage, EngineConfig::default(), None).unwrap()
    }

    fn input(category: &str, content: &str) -> RecordInput {
        RecordInput {
            category: category.into(),
            content: content.into(),
            rationale: None,
            context: None,
            tags: Vec::new(),
            file_path: None,
            is_permanent: None,
        }
    }

    #[test]
    fn test_record_and_recall_roundtrip() {
        let manager = manager();
        manager.record(input("decision", "use postgres for the ledger service")).unwrap();
        let result = manager.recall("postgres ledger", RecallFilters::with_limit(10)).unwrap();
        assert!(result.by_category.get("decision").map(|v| !v.is_empty()).unwrap_or(false));
    }

    #[test]
    fn test_recall_excludes_archived_by_default() {
        let manager = manager();
        let id = manager.record(input("learning", "switched retries to exponential backoff")).unwrap().id;
        manager.archive(id, true).unwrap();
        let result = manager.recall("exponential backoff", RecallFilters::with_limit(10)).unwrap();
        assert!(result.by_category.values().flatten().all(|m| m.memory.id != id));
    }

    #[test]
    fn test_pattern_defaults_to_permanent_and_skips_recency() {
        let manager = manager();
        let id = manager.record(input("pattern", "always validate input at the boundary")).unwrap().id;
        let row = manager.storage.get_memory(id).unwrap().unwrap();
        assert!(row.is_permanent);
    }

    #[test]
    fn test_conflict_detected_on_negation_disagreement() {
        let manager = manager();
        manager.record(input("decision", "use redis for session storage")).unwrap();
        let result = manager
            .record(input("decision", "do not use redis for session storage, it drops data"))
            .unwrap();
        assert!(!result.conflicts.is_empty());
    }

    #[test]
    fn test_conflict_detected_on_cross_category_same_file() {
        let manager = manager();
        let mut decision = input("decision", "use session cookies for auth");
        decision.file_path = Some("auth.py".into());
        let decision_id = manager.record(decision).unwrap().id;

        let mut warning = input("warning", "session cookies caused race conditions");
        warning.file_path = Some("auth.py".into());
        let result = manager.record(warning).unwrap();

        assert!(result.conflicts.iter().any(|c| c.memory_id == decision_id));
    }

    #[test]
    fn test_seal_outcome_then_recall_boosts_score() {
        let manager = manager();
        let id = manager.record(input("decision", "adopt the new queue library")).unwrap().id;
        manager.seal_outcome(id, "caused data loss", false).unwrap();
        let row = manager.storage.get_memory(id).unwrap().unwrap();
        assert_eq!(row.worked, Some(false));
    }

    #[test]
    fn test_prune_removes_old_unaccessed_decision() {
        let manager = manager();
        let id = manager.record(input("decision", "temporary feature flag for checkout")).unwrap().id;
        let pruned = manager
            .prune(PruneOptions { older_than_days: 0.0, dry_run: false, ..Default::default() })
            .unwrap();
        assert_eq!(pruned, vec![id]);
        assert!(manager.storage.get_memory(id).unwrap().is_none());
    }

    #[test]
    fn test_prune_skips_permanent_memories() {
        let manager = manager();
        manager.record(input("pattern", "always use transactions for multi-row writes")).unwrap();
        let pruned = manager
            .prune(PruneOptions { older_than_days: 0.0, dry_run: false, ..Default::default() })
            .unwrap();
        assert!(pruned.is_empty());
    }

    #[test]
    fn test_prune_skips_successful_outcomes_when_protected() {
        let manager = manager();
        let id = manager.record(input("decision", "switch checkout to the new payment gateway")).unwrap().id;
        manager.seal_outcome(id, "worked as expected", true).unwrap();
        let pruned = manager
            .prune(PruneOptions { older_than_days: 0.0, dry_run: false, protect_successful: true, ..Default::default() })
            .unwrap();
        assert!(pruned.is_empty());
    }

    #[test]
    fn test_cleanup_duplicates_keeps_newest_and_merges_outcome() {
        let manager = manager();
        let older = manager.record(input("decision", "use redis for session storage")).unwrap().id;
        manager.seal_outcome(older, "worked well in staging", true).unwrap();
        let newer = manager.record(input("decision", "use redis for session storage")).unwrap().id;

        let removed = manager.cleanup_duplicates(false).unwrap();
        assert_eq!(removed, 1);
        assert!(manager.storage.get_memory(older).unwrap().is_none());
        let survivor = manager.storage.get_memory(newer).unwrap().unwrap();
        assert_eq!(survivor.worked, Some(true));
    }

    #[test]
    fn test_condensed_recall_drops_rationale_and_context() {
        let manager = manager();
        manager
            .record(RecordInput {
                rationale: Some("because it scales horizontally".into()),
                context: Some("during the Q3 infra review".into()),
                ..input("decision", "use kafka for the event bus")
            })
            .unwrap();
        let filters = RecallFilters { condensed: true, ..RecallFilters::with_limit(10) };
        let result = manager.recall("kafka event bus", filters).unwrap();
        let hit = result.by_category.get("decision").and_then(|v| v.first()).unwrap();
        assert!(hit.memory.rationale.is_none());
        assert!(hit.memory.context.is_none());
    }

    #[test]
    fn test_rebuild_index_restores_lexical_hits() {
        let manager = manager();
        manager.record(input("warning", "never store secrets in plaintext config")).unwrap();
        let rebuilt = manager.rebuild_index().unwrap();
        assert_eq!(rebuilt, 1);
        let result = manager.recall("plaintext config", RecallFilters::with_limit(10)).unwrap();
        assert!(!result.by_category.is_empty());
    }
}
