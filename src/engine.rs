//! Composite-operations facade.
//!
//! Wires the memory manager, causal graph, rule engine, code indexer, file
//! watcher, and protocol gate into the operations an assistant actually
//! calls: the higher-order ones (`briefing`, `context_check`, `compact`,
//! `propose_refactor`, `ingest_doc`, `find_related`, `health`,
//! `export_data`/`import_data`) that compose several modules, plus gated
//! pass-throughs for everything else.
//!
//! `Graph`/`RuleEngine`/`CodeIndexer` all borrow `&Storage` for their
//! lifetime parameter. Storing one of them as an `Engine` field would make
//! `Engine` self-referential over the `Storage` that `MemoryManager` owns,
//! so instead each method constructs the one it needs for the call and
//! lets it drop at the end — the same throwaway-index style
//! `CodeIndexer::find_code` already uses for its lexical index.
//!
//! All public operations are `async fn` per the single-process cooperative
//! scheduling model, even though every one of them wraps purely synchronous
//! calls into the (synchronous) core modules.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::code_index::{
    CodeIndexer, Entity, EntityKind, ImpactAnalysis, LanguagePack, ProjectIndexReport, PythonPack,
    RustPack, TodoMarker,
};
use crate::collaborators::{DocFetcher, Embedder, GitChanges, GitProbe};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::gate::ProtocolGate;
use crate::graph::{Direction, Edge, ExportFormat, ExportSeed, Graph, Relationship, Subgraph};
use crate::memory::manager::{condense, memory_from_row, PruneOptions};
use crate::memory::{
    Category, Memory, MemoryManager, RecallFilters, RecallResult, RecordInput, RecordResult,
    ScoredMemory,
};
use crate::rules::{Rule, RuleEngine, RuleInput, RuleMatches};
use crate::storage::{EntityRow, Storage};
use crate::watcher::{
    DesktopChannel, FileWatcher, LogFileChannel, NotificationChannel, PollFileChannel,
    WatcherStats,
};

/// Cap on `record_batch`, matching the source's bounded batch-ingestion
/// surface rather than accepting an unbounded transaction.
const MAX_BATCH_SIZE: usize = 20;
/// `briefing`'s "recent memories" window.
const RECENT_MEMORY_LIMIT: usize = 20;
/// `briefing`'s git-changes lookback window.
const GIT_LOOKBACK_DAYS: i64 = 7;
/// Score assigned to a direct graph neighbor in `find_related`, ranking it
/// above anything the lexical/vector duplicate comparator alone could find.
const GRAPH_NEIGHBOR_SCORE: f32 = 0.99;
/// Target chunk size (characters) for `ingest_doc`.
const DOC_CHUNK_SIZE: usize = 2000;
/// Number of top memories `export_graph`'s topic-seeded path pulls from
/// `recall` before expanding each one via `trace`.
const EXPORT_TOPIC_SEED_LIMIT: usize = 5;

/// The composite-operations facade over one project's storage, plus
/// (optionally) the cross-project global partition's.
pub struct Engine {
    project_path: String,
    project_root: PathBuf,
    config: EngineConfig,
    memory: MemoryManager,
    global_memory: Option<MemoryManager>,
    gate: ProtocolGate,
    git_probe: Option<Arc<dyn GitProbe>>,
    doc_fetcher: Option<Arc<dyn DocFetcher>>,
    watcher: Mutex<Option<FileWatcher>>,
    last_compaction: Mutex<Option<DateTime<Utc>>>,
}

impl Engine {
    /// Open the project's storage (and the global partition's, if
    /// `config.global_enabled`), building both managers' in-memory indices
    /// from persisted rows, and start the file watcher if configured.
    pub fn open(
        project_root: impl Into<PathBuf>,
        config: EngineConfig,
        embedder: Option<Arc<dyn Embedder>>,
        git_probe: Option<Arc<dyn GitProbe>>,
        doc_fetcher: Option<Arc<dyn DocFetcher>>,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let project_path = project_root.to_string_lossy().into_owned();

        let db_path = config.storage_path.join("storage").join("db.sqlite");
        let storage = Storage::open_with_key(&db_path, config.encryption_key.as_deref())?;
        let memory = MemoryManager::new(storage, config.clone(), embedder.clone())?;

        let global_memory = if config.global_enabled {
            let global_storage =
                Storage::open_with_key(&config.global_path.join("db.sqlite"), config.encryption_key.as_deref())?;
            Some(MemoryManager::new(global_storage, config.clone(), embedder)?)
        } else {
            None
        };

        let engine = Self {
            project_path,
            project_root,
            gate: ProtocolGate::new(config.context_token_ttl_seconds),
            config,
            memory,
            global_memory,
            git_probe,
            doc_fetcher,
            watcher: Mutex::new(None),
            last_compaction: Mutex::new(None),
        };

        if engine.config.watcher_enabled {
            engine.start_watcher()?;
        }

        Ok(engine)
    }

    fn language_packs() -> Vec<Box<dyn LanguagePack>> {
        vec![Box::new(RustPack), Box::new(PythonPack)]
    }

    // -- record --------------------------------------------------------

    /// Record a memory, writing it into the global partition as well when
    /// its content reads as project-independent: no `file_path`, no mention
    /// of "this repo/codebase/project", no ticket-number reference, and
    /// language suggesting a general rule ("always", "never", "best
    /// practice", ...). Anything else — including anything uncertain —
    /// stays local only.
    pub async fn record(&self, input: RecordInput) -> Result<RecordResult> {
        self.gate.requires_context(&self.project_path, "record")?;
        self.record_one(input)
    }

    /// Record up to [`MAX_BATCH_SIZE`] memories in one gated call.
    pub async fn record_batch(&self, inputs: Vec<RecordInput>) -> Result<Vec<RecordResult>> {
        self.gate.requires_context(&self.project_path, "record_batch")?;
        if inputs.len() > MAX_BATCH_SIZE {
            return Err(EngineError::InvalidInput(format!(
                "record_batch accepts at most {MAX_BATCH_SIZE} items, got {}",
                inputs.len()
            )));
        }
        inputs.into_iter().map(|input| self.record_one(input)).collect()
    }

    fn record_one(&self, input: RecordInput) -> Result<RecordResult> {
        if also_global(&input) {
            if let Some(global) = self.global_memory.as_ref() {
                if self.config.global_write_enabled {
                    if let Err(err) = global.record(input.clone()) {
                        tracing::warn!(error = %err, "failed to mirror memory into global partition");
                    }
                }
            }
        }
        self.memory.record(input)
    }

    // -- recall ----------------------------------------------------------

    /// Recall from the project partition, merged with the global
    /// partition's hits (tagged `fromGlobal`) when one is configured. Local
    /// hits take precedence: a global memory whose normalized content
    /// duplicates a local one is dropped rather than shown twice.
    pub async fn recall(&self, query: &str, filters: RecallFilters) -> Result<RecallResult> {
        let mut result = self.memory.recall(query, filters.clone())?;
        if let Some(global) = &self.global_memory {
            let global_result = global.recall(query, filters)?;
            for (category, hits) in global_result.by_category.into_iter() {
                let seen: std::collections::HashSet<String> = result
                    .by_category
                    .get(&category)
                    .map(|v| v.iter().map(|h| normalize(&h.memory.content)).collect())
                    .unwrap_or_default();
                let entry = result.by_category.entry(category).or_default();
                for mut hit in hits {
                    if seen.contains(&normalize(&hit.memory.content)) {
                        continue;
                    }
                    hit.memory.from_global = true;
                    entry.push(hit);
                }
            }
        }
        Ok(result)
    }

    pub async fn recall_for_file(&self, file_path: &str) -> Result<Vec<Memory>> {
        self.memory.recall_for_file(file_path)
    }

    /// `find_related`: the union of `memory_id`'s direct causal neighbors
    /// (graph trace at depth 1) and the near-duplicate candidates the
    /// memory manager's own hybrid comparator surfaces, deduplicated by id
    /// and ranked with graph neighbors first.
    pub async fn find_related(&self, memory_id: i64, limit: usize) -> Result<Vec<ScoredMemory>> {
        let graph = Graph::new(self.memory.storage());
        let neighbors = graph.trace(memory_id, Direction::Both, None, Some(1))?;

        let mut merged: std::collections::HashMap<i64, ScoredMemory> = std::collections::HashMap::new();
        for node in neighbors.nodes {
            if node.id == memory_id || node.is_archived {
                continue;
            }
            merged.insert(node.id, ScoredMemory { memory: node, score: GRAPH_NEIGHBOR_SCORE });
        }
        for scored in self.memory.find_related(memory_id, limit)? {
            merged
                .entry(scored.memory.id)
                .and_modify(|existing| {
                    if scored.score > existing.score {
                        existing.score = scored.score;
                    }
                })
                .or_insert(scored);
        }

        let mut out: Vec<ScoredMemory> = merged.into_values().collect();
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        out.truncate(limit);
        Ok(out)
    }

    /// Combined hybrid search over memories and code entities.
    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchResult> {
        let memories = self.recall(query, RecallFilters::with_limit(limit)).await?;
        let storage = self.memory.storage();
        let indexer = CodeIndexer::with_diversity_cap(storage, self.project_path.clone(), Self::language_packs(), self.config.search_diversity_max_per_file);
        let code = indexer.find_code(query, limit)?;
        Ok(SearchResult { memories, code })
    }

    // -- lifecycle ---------------------------------------------------------

    pub async fn seal_outcome(&self, id: i64, description: &str, worked: bool) -> Result<()> {
        self.gate.requires_context(&self.project_path, "seal_outcome")?;
        self.memory.seal_outcome(id, description, worked)
    }

    pub async fn pin(&self, id: i64, pinned: bool) -> Result<()> {
        self.gate.requires_context(&self.project_path, "pin")?;
        self.memory.pin(id, pinned)
    }

    pub async fn archive(&self, id: i64, archived: bool) -> Result<()> {
        self.gate.requires_context(&self.project_path, "archive")?;
        self.memory.archive(id, archived)
    }

    pub async fn prune(&self, options: PruneOptions) -> Result<Vec<i64>> {
        self.gate.requires_context(&self.project_path, "prune")?;
        self.memory.prune(options)
    }

    pub async fn cleanup_duplicates(&self, dry_run: bool) -> Result<usize> {
        self.gate.requires_context(&self.project_path, "cleanup_duplicates")?;
        self.memory.cleanup_duplicates(dry_run)
    }

    pub async fn rebuild_index(&self) -> Result<usize> {
        self.memory.rebuild_index()
    }

    // -- graph ---------------------------------------------------------

    pub async fn link(
        &self,
        source_id: i64,
        target_id: i64,
        relationship: Relationship,
        description: Option<&str>,
        confidence: f64,
    ) -> Result<i64> {
        self.gate.requires_context(&self.project_path, "link")?;
        Graph::new(self.memory.storage()).link(source_id, target_id, relationship, description, confidence)
    }

    pub async fn unlink(&self, edge_id: i64) -> Result<()> {
        self.gate.requires_context(&self.project_path, "unlink")?;
        Graph::new(self.memory.storage()).unlink(edge_id)
    }

    pub async fn trace(
        &self,
        start: i64,
        direction: Direction,
        relationship_filter: Option<&[Relationship]>,
        max_depth: Option<u32>,
    ) -> Result<Subgraph> {
        Graph::new(self.memory.storage()).trace(start, direction, relationship_filter, max_depth)
    }

    /// Export a subgraph, seeded either by explicit memory ids or by the
    /// top memories matching a topic (resolved here via `recall`, then
    /// expanded by [`Graph::export`] exactly like an explicit-`ids` call).
    pub async fn export_graph(&self, format: ExportFormat, seed: ExportSeed, include_orphans: bool) -> Result<String> {
        let ids = match seed {
            ExportSeed::Ids(ids) => ids,
            ExportSeed::Topic(topic) => {
                let filters = RecallFilters { limit: EXPORT_TOPIC_SEED_LIMIT, ..Default::default() };
                let recalled = self.memory.recall(&topic, filters)?;
                recalled
                    .by_category
                    .into_values()
                    .flatten()
                    .map(|scored| scored.memory.id)
                    .collect()
            }
        };
        Graph::new(self.memory.storage()).export(format, &ids, include_orphans)
    }

    // -- rules -----------------------------------------------------------

    pub async fn add_rule(&self, input: RuleInput) -> Result<i64> {
        self.gate.requires_context(&self.project_path, "add_rule")?;
        RuleEngine::new(self.memory.storage())?.add_rule(input)
    }

    pub async fn update_rule(&self, id: i64, input: RuleInput) -> Result<()> {
        self.gate.requires_context(&self.project_path, "update_rule")?;
        RuleEngine::new(self.memory.storage())?.update_rule(id, input)
    }

    pub async fn list_rules(&self, enabled_only: bool) -> Result<Vec<Rule>> {
        RuleEngine::new(self.memory.storage())?.list_rules(enabled_only)
    }

    pub async fn check_rules(&self, action: &str, context: Option<&str>) -> Result<RuleMatches> {
        RuleEngine::new(self.memory.storage())?.check_rules(action, context)
    }

    // -- code index ------------------------------------------------------

    pub async fn index_project(&self, force: bool) -> Result<ProjectIndexReport> {
        let storage = self.memory.storage();
        let indexer = CodeIndexer::with_diversity_cap(storage, self.project_path.clone(), Self::language_packs(), self.config.search_diversity_max_per_file);
        indexer.index_project(&self.project_root, force || !self.config.index_incremental)
    }

    pub async fn find_code(&self, query: &str, limit: usize) -> Result<Vec<Entity>> {
        let storage = self.memory.storage();
        CodeIndexer::with_diversity_cap(storage, self.project_path.clone(), Self::language_packs(), self.config.search_diversity_max_per_file).find_code(query, limit)
    }

    pub async fn analyze_impact(&self, entity_name: &str) -> Result<Vec<ImpactAnalysis>> {
        let storage = self.memory.storage();
        CodeIndexer::with_diversity_cap(storage, self.project_path.clone(), Self::language_packs(), self.config.search_diversity_max_per_file).analyze_impact(entity_name)
    }

    pub async fn scan_todos(&self) -> Result<Vec<TodoMarker>> {
        crate::code_index::scan_todos(&self.project_root)
    }

    // -- watcher ---------------------------------------------------------

    /// Start the file watcher, wiring up the log-file and poll-file
    /// channels unconditionally and the desktop channel when configured.
    /// A no-op if already running.
    pub fn start_watcher(&self) -> Result<()> {
        let mut guard = self.watcher.lock().map_err(|_| EngineError::Internal("watcher lock poisoned".into()))?;
        if guard.is_some() {
            return Ok(());
        }
        let storage_dir = self.config.storage_path.join("storage");
        std::fs::create_dir_all(&storage_dir)?;

        let mut channels: Vec<Box<dyn NotificationChannel>> = vec![
            Box::new(LogFileChannel::new(storage_dir.join("watcher.log"))),
            Box::new(PollFileChannel::new(storage_dir.join("editor-poll.json"))),
        ];
        if self.config.watcher_system_notifications {
            channels.push(Box::new(DesktopChannel));
        }

        let debounce = Duration::from_secs_f64(self.config.watcher_debounce_seconds);
        let watcher = FileWatcher::with_debounce(&self.project_root, debounce, channels)?;
        *guard = Some(watcher);
        Ok(())
    }

    pub fn stop_watcher(&self) {
        if let Ok(mut guard) = self.watcher.lock() {
            *guard = None;
        }
    }

    pub fn watcher_stats(&self) -> Option<WatcherStats> {
        self.watcher.lock().ok().and_then(|g| g.as_ref().map(FileWatcher::stats))
    }

    /// Drain newly-ready filesystem events and re-index/notify for them.
    /// Meant to be driven periodically by the caller's own task loop — see
    /// [`crate::watcher`]'s module docs on why this is polled rather than
    /// run on a background thread. Returns the number of paths processed.
    pub fn poll_watcher(&self) -> Result<usize> {
        let guard = self.watcher.lock().map_err(|_| EngineError::Internal("watcher lock poisoned".into()))?;
        let Some(watcher) = guard.as_ref() else { return Ok(0) };
        let ready = watcher.poll_ready_paths();
        if ready.is_empty() {
            return Ok(0);
        }
        let storage = self.memory.storage();
        let indexer = CodeIndexer::with_diversity_cap(storage, self.project_path.clone(), Self::language_packs(), self.config.search_diversity_max_per_file);
        watcher.process_ready(&indexer, &self.memory, &ready);
        Ok(ready.len())
    }

    // -- composite operations ----------------------------------------------

    /// Session-start summary: the most recent memories (condensed),
    /// standing warnings, recently-failed approaches, the configured rule
    /// count, and a git-activity snapshot. Registers the initialization
    /// token every other mutating operation needs.
    pub async fn briefing(&self, focus_areas: Option<Vec<String>>) -> Result<Briefing> {
        let mut rows = self.memory.storage().list_memories(false)?;
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(RECENT_MEMORY_LIMIT);
        let mut recent_memories: Vec<Memory> = rows.into_iter().map(|r| memory_from_row(r, false)).collect();

        if let Some(areas) = &focus_areas {
            let lower_areas: Vec<String> = areas.iter().map(|a| a.to_lowercase()).collect();
            recent_memories.retain(|m| {
                let content = m.content.to_lowercase();
                lower_areas
                    .iter()
                    .any(|a| content.contains(a.as_str()) || m.tags.iter().any(|t| t.eq_ignore_ascii_case(a)))
            });
        }
        for memory in &mut recent_memories {
            condense(memory);
        }

        let warnings = self.memory.recall(
            "",
            RecallFilters { categories: vec!["warning".into()], limit: 10, condensed: true, ..Default::default() },
        )?;
        let active_warnings: Vec<Memory> = warnings
            .by_category
            .get("warning")
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.memory)
            .collect();

        let failed = self.memory.recall("", RecallFilters { limit: 40, condensed: true, ..Default::default() })?;
        let mut failed_approaches: Vec<Memory> = failed
            .by_category
            .into_values()
            .flatten()
            .filter(|s| s.memory.outcome.as_ref().map(|o| !o.worked).unwrap_or(false))
            .map(|s| s.memory)
            .collect();
        failed_approaches.truncate(10);

        let git_changes = if let Some(probe) = &self.git_probe {
            let since = (Utc::now() - chrono::Duration::days(GIT_LOOKBACK_DAYS)).timestamp();
            probe.changes_since(since).unwrap_or_default()
        } else {
            GitChanges::default()
        };

        let briefing = Briefing {
            recent_memories,
            active_warnings,
            failed_approaches,
            rule_count: self.memory.storage().rule_count()? as usize,
            memory_count: self.memory.storage().memory_count()?,
            git_changes,
        };

        self.gate.register_initialization(&self.project_path);
        Ok(briefing)
    }

    /// Grounds the next step in the current description: recall plus
    /// matching rule guidance, combined, with a fresh context token.
    pub async fn context_check(&self, description: &str) -> Result<ContextCheckResult> {
        self.gate.requires_initialization(&self.project_path, "context_check")?;
        let recall = self.recall(description, RecallFilters::with_limit(10)).await?;
        let rule_matches = RuleEngine::new(self.memory.storage())?.check_rules(description, None)?;
        let context_token_valid_until = self.gate.register_context(&self.project_path);
        Ok(ContextCheckResult { recall, rule_matches, context_token_valid_until })
    }

    /// Summarize up to `limit` eligible episodic memories (oldest first)
    /// into one checkpoint learning, `supersedes`-link each original to
    /// it, and archive the originals. Eligible means decisions with a
    /// sealed outcome, or learnings regardless of outcome — never
    /// patterns/warnings (always permanent) and never pinned memories.
    /// `topic`, if given, additionally scopes candidates to those whose
    /// analyzed keywords overlap it. Restricted to this project's own
    /// partition — never the global one. `dry_run` (the default) reports
    /// what would be archived without writing anything.
    pub async fn compact(&self, limit: usize, topic: Option<&str>, dry_run: bool) -> Result<CompactResult> {
        self.gate.requires_context(&self.project_path, "compact")?;

        let topic_keywords = topic.map(|t| crate::analyzer::analyze(t).keywords);

        let mut candidates: Vec<Memory> = self
            .memory
            .storage()
            .list_memories(false)?
            .into_iter()
            .map(|r| memory_from_row(r, false))
            .filter(|m| {
                !m.is_permanent
                    && !m.is_pinned
                    && match m.category {
                        Category::Decision => m.outcome.is_some(),
                        Category::Learning => true,
                        Category::Pattern | Category::Warning => false,
                    }
            })
            .filter(|m| match &topic_keywords {
                Some(keywords) => m.keywords.iter().any(|k| keywords.contains(k)),
                None => true,
            })
            .collect();
        candidates.sort_by_key(|m| m.created_at);
        candidates.truncate(limit);

        if candidates.is_empty() {
            return Ok(CompactResult { summary_memory_id: None, archived_ids: Vec::new(), dry_run });
        }

        let archived_ids: Vec<i64> = candidates.iter().map(|m| m.id).collect();
        if dry_run {
            return Ok(CompactResult { summary_memory_id: None, archived_ids, dry_run });
        }

        let now = Utc::now();
        let summary = RecordInput {
            category: "learning".into(),
            content: checkpoint_summary(&candidates, now),
            rationale: None,
            context: None,
            tags: vec!["compacted".into(), "checkpoint".into()],
            file_path: None,
            is_permanent: Some(true),
        };
        let record_result = self.memory.record(summary)?;

        let graph = Graph::new(self.memory.storage());
        for id in &archived_ids {
            if let Err(err) = graph.link(*id, record_result.id, Relationship::Supersedes, Some("compacted into checkpoint"), 1.0) {
                tracing::warn!(memory_id = id, error = %err, "failed to link compacted memory to its checkpoint");
            }
            self.memory.archive(*id, true)?;
        }

        if let Ok(mut last) = self.last_compaction.lock() {
            *last = Some(now);
        }

        Ok(CompactResult { summary_memory_id: Some(record_result.id), archived_ids, dry_run })
    }

    /// Gather everything relevant to changing `file_path`: memories
    /// attached to it, each one's backward causal chain (what led to it),
    /// outstanding TODO/FIXME markers in the file, and matching rule
    /// guidance, distilled into constraint/opportunity lists.
    pub async fn propose_refactor(&self, file_path: &str) -> Result<RefactorProposal> {
        self.gate.requires_context(&self.project_path, "propose_refactor")?;

        let related_memories = self.memory.recall_for_file(file_path)?;

        let graph = Graph::new(self.memory.storage());
        let mut causal_context = Vec::new();
        for memory in &related_memories {
            causal_context.push(graph.trace(memory.id, Direction::Backward, None, Some(2))?);
        }

        let todos: Vec<TodoMarker> = crate::code_index::scan_todos(&self.project_root)?
            .into_iter()
            .filter(|t| t.file_path == file_path)
            .collect();

        let matching_rules = RuleEngine::new(self.memory.storage())?.check_rules(&format!("refactor {file_path}"), None)?;

        let mut constraints = Vec::new();
        let mut opportunities = Vec::new();
        for memory in &related_memories {
            match memory.category {
                Category::Warning => constraints.push(memory.content.clone()),
                Category::Decision if memory.outcome.as_ref().map(|o| !o.worked).unwrap_or(false) => {
                    constraints.push(format!("previously failed here: {}", memory.content));
                }
                Category::Pattern => opportunities.push(memory.content.clone()),
                _ => {}
            }
        }
        constraints.extend(matching_rules.must_not.iter().map(|g| g.text.clone()));
        if !todos.is_empty() {
            opportunities.push(format!("{} outstanding TODO/FIXME marker(s) in this file", todos.len()));
        }

        Ok(RefactorProposal {
            file_path: file_path.to_string(),
            related_memories,
            causal_context,
            todos,
            matching_rules,
            constraints,
            opportunities,
        })
    }

    /// Fetch `url`, split its body into paragraph-bounded chunks of roughly
    /// [`DOC_CHUNK_SIZE`] characters, and record each as a permanent
    /// learning tagged `topic`, linked to its neighbors in file order.
    pub async fn ingest_doc(&self, url: &str, topic: &str) -> Result<Vec<i64>> {
        self.gate.requires_context(&self.project_path, "ingest_doc")?;
        let fetcher = self
            .doc_fetcher
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("ingest_doc requires a configured DocFetcher".into()))?;
        let bytes = fetcher.fetch(url).map_err(EngineError::BackendError)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let chunks = chunk_by_paragraph(&text, DOC_CHUNK_SIZE);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let result = self.memory.record(RecordInput {
                category: "learning".into(),
                content: chunk,
                rationale: None,
                context: Some(format!("ingested from {url}")),
                tags: vec![topic.to_string()],
                file_path: None,
                is_permanent: Some(true),
            })?;
            ids.push(result.id);
        }

        let graph = Graph::new(self.memory.storage());
        for pair in ids.windows(2) {
            if let Err(err) = graph.link(pair[0], pair[1], Relationship::RelatedTo, Some("adjacent chunk of the same document"), 1.0) {
                tracing::warn!(error = %err, "failed to link adjacent document chunks");
            }
        }

        Ok(ids)
    }

    /// Diagnostic snapshot: schema version, row counts, retrieval-backend
    /// readiness, watcher state, and the last compaction time.
    pub async fn health(&self) -> Result<Health> {
        let storage = self.memory.storage();
        Ok(Health {
            schema_version: storage.schema_version()?,
            memory_count: storage.memory_count()?,
            rule_count: storage.rule_count()?,
            entity_count: storage.entity_count_for_project(&self.project_path)?,
            vector_search_available: self.memory.vector_search_available(),
            global_partition_enabled: self.global_memory.is_some(),
            watcher_running: self.watcher.lock().map(|w| w.is_some()).unwrap_or(false),
            initialized: self.gate.is_initialized(&self.project_path),
            last_compaction: self.last_compaction.lock().ok().and_then(|g| *g),
        })
    }

    /// A full snapshot of this project's memories, edges, rules, and code
    /// entities (the global partition is never included — it has its own
    /// project path and is exported by opening an `Engine` on it directly).
    pub async fn export_data(&self) -> Result<DataSnapshot> {
        let storage = self.memory.storage();
        let memories: Vec<Memory> = storage.list_memories(true)?.into_iter().map(|r| memory_from_row(r, false)).collect();
        let edges: Vec<Edge> = storage
            .list_all_edges()?
            .into_iter()
            .map(|row| Edge {
                id: row.id,
                source_id: row.source_id,
                target_id: row.target_id,
                relationship: row.relationship,
                description: row.description,
                confidence: row.confidence,
            })
            .collect();
        let rules = RuleEngine::new(storage)?.list_rules(false)?;
        let entities = storage
            .list_entities_for_project(&self.project_path)?
            .into_iter()
            .map(entity_from_entity_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(DataSnapshot { project_path: self.project_path.clone(), memories, edges, rules, entities })
    }

    /// Restore a snapshot into this project's partition. `merge: false`
    /// wipes existing memories first; either way, ids are reassigned by
    /// `record` and edges/rules are relinked against the new ids. Exact
    /// `created_at`/`access_count` history is not preserved — only `record`
    /// ever mints rows, and it always stamps them fresh.
    pub async fn import_data(&self, snapshot: &DataSnapshot, merge: bool) -> Result<()> {
        self.gate.requires_initialization(&self.project_path, "import_data")?;

        if !merge {
            for row in self.memory.storage().list_memories(true)? {
                self.memory.storage().delete_memory(row.id)?;
            }
        }

        let mut id_map: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
        for memory in &snapshot.memories {
            let result = self.memory.record(RecordInput {
                category: memory.category.as_str().to_string(),
                content: memory.content.clone(),
                rationale: memory.rationale.clone(),
                context: memory.context.clone(),
                tags: memory.tags.clone(),
                file_path: memory.file_path.clone(),
                is_permanent: Some(memory.is_permanent),
            })?;
            id_map.insert(memory.id, result.id);
            if memory.is_pinned {
                self.memory.pin(result.id, true)?;
            }
            if memory.is_archived {
                self.memory.archive(result.id, true)?;
            }
            if let Some(outcome) = &memory.outcome {
                self.memory.seal_outcome(result.id, &outcome.description, outcome.worked)?;
            }
        }

        let graph = Graph::new(self.memory.storage());
        for edge in &snapshot.edges {
            let (Some(&source), Some(&target)) = (id_map.get(&edge.source_id), id_map.get(&edge.target_id)) else {
                continue;
            };
            let Some(relationship) = Relationship::parse_name(&edge.relationship) else { continue };
            if let Err(err) = graph.link(source, target, relationship, edge.description.as_deref(), edge.confidence) {
                tracing::warn!(error = %err, "failed to relink imported edge");
            }
        }

        let rule_engine = RuleEngine::new(self.memory.storage())?;
        for rule in &snapshot.rules {
            rule_engine.add_rule(RuleInput {
                trigger: rule.trigger.clone(),
                must_do: rule.must_do.clone(),
                must_not: rule.must_not.clone(),
                ask_first: rule.ask_first.clone(),
                warnings: rule.warnings.clone(),
                priority: rule.priority,
            })?;
        }

        // Entity ids are content-addressed (project|path|qualified_name|kind),
        // so re-upserting is idempotent and needs no id remapping. `file_hashes`
        // is deliberately left alone: entities carry no content hash to restore
        // one from, and the next `index_project` will simply re-hash and
        // re-index each file as if changed.
        for entity in &snapshot.entities {
            let mut row = entity_row_from_entity(entity);
            row.project_path = self.project_path.clone();
            self.memory.storage().upsert_entity(&row)?;
        }

        self.memory.rebuild_index()?;
        Ok(())
    }
}

/// Classifies whether a `record`'d memory should also be mirrored into the
/// global cross-project partition: anything tied to this project (a file
/// path, a mention of "this repo/codebase/project", a ticket reference)
/// stays local; generically-phrased rules ("always", "never", "best
/// practice", ...) go to both. Uncertain content stays local only.
fn also_global(input: &RecordInput) -> bool {
    if input.file_path.is_some() {
        return false;
    }
    let lower = input.content.to_lowercase();
    const LOCAL_SIGNALS: &[&str] = &["this repo", "this codebase", "this project", "our repo", "our codebase"];
    if LOCAL_SIGNALS.iter().any(|s| lower.contains(s)) {
        return false;
    }
    if mentions_ticket_number(&lower) {
        return false;
    }
    const UNIVERSAL_SIGNALS: &[&str] = &["always ", "never ", "in general", "best practice", "as a rule", "universally"];
    UNIVERSAL_SIGNALS.iter().any(|s| lower.contains(s)) || input.tags.iter().any(|t| t.eq_ignore_ascii_case("best-practice"))
}

fn mentions_ticket_number(lower: &str) -> bool {
    let bytes = lower.as_bytes();
    bytes
        .iter()
        .enumerate()
        .any(|(i, b)| *b == b'#' && bytes.get(i + 1).map(u8::is_ascii_digit).unwrap_or(false))
}

fn normalize(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn checkpoint_summary(candidates: &[Memory], now: DateTime<Utc>) -> String {
    let mut out = format!("Checkpoint compacted on {} from {} memories:\n", now.to_rfc3339(), candidates.len());
    for memory in candidates {
        let outcome = memory.outcome.as_ref().map(|o| if o.worked { "worked" } else { "failed" }).unwrap_or("unsealed");
        let content: String = memory.content.chars().take(140).collect();
        out.push_str(&format!("- [{}] {content} ({outcome})\n", memory.category.as_str()));
    }
    out
}

fn chunk_by_paragraph(text: &str, chunk_size: usize) -> Vec<String> {
    let paragraphs: Vec<&str> = text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect();
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if !current.is_empty() && current.len() + paragraph.len() + 2 > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);

        while current.len() > chunk_size {
            let split_at = current.char_indices().nth(chunk_size).map(|(i, _)| i).unwrap_or(current.len());
            let tail = current.split_off(split_at);
            chunks.push(std::mem::replace(&mut current, tail));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn entity_kind_from_str(s: &str) -> Option<EntityKind> {
    match s {
        "class" => Some(EntityKind::Class),
        "function" => Some(EntityKind::Function),
        "method" => Some(EntityKind::Method),
        "interface" => Some(EntityKind::Interface),
        "import" => Some(EntityKind::Import),
        _ => None,
    }
}

fn entity_from_entity_row(row: EntityRow) -> Result<Entity> {
    let kind = entity_kind_from_str(&row.kind)
        .ok_or_else(|| EngineError::Internal(format!("unknown entity kind: {}", row.kind)))?;
    Ok(Entity {
        id: row.id,
        project_path: row.project_path,
        file_path: row.file_path,
        qualified_name: row.qualified_name,
        name: row.name,
        kind,
        line_start: row.line_start,
        line_end: row.line_end,
        signature: row.signature,
        docstring: row.docstring,
        language: row.language,
        imports: serde_json::from_str(&row.imports_json)?,
        inherits: serde_json::from_str(&row.inherits_json)?,
        calls: serde_json::from_str(&row.calls_json)?,
    })
}

fn entity_row_from_entity(entity: &Entity) -> EntityRow {
    EntityRow {
        id: entity.id.clone(),
        project_path: entity.project_path.clone(),
        file_path: entity.file_path.clone(),
        qualified_name: entity.qualified_name.clone(),
        name: entity.name.clone(),
        kind: entity.kind.as_str().to_string(),
        line_start: entity.line_start,
        line_end: entity.line_end,
        signature: entity.signature.clone(),
        docstring: entity.docstring.clone(),
        language: entity.language.clone(),
        imports_json: serde_json::to_string(&entity.imports).unwrap_or_else(|_| "[]".to_string()),
        inherits_json: serde_json::to_string(&entity.inherits).unwrap_or_else(|_| "[]".to_string()),
        calls_json: serde_json::to_string(&entity.calls).unwrap_or_else(|_| "[]".to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub memories: RecallResult,
    pub code: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Briefing {
    pub recent_memories: Vec<Memory>,
    pub active_warnings: Vec<Memory>,
    pub failed_approaches: Vec<Memory>,
    pub rule_count: usize,
    pub memory_count: i64,
    pub git_changes: GitChanges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCheckResult {
    pub recall: RecallResult,
    pub rule_matches: RuleMatches,
    pub context_token_valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactResult {
    pub summary_memory_id: Option<i64>,
    pub archived_ids: Vec<i64>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefactorProposal {
    pub file_path: String,
    pub related_memories: Vec<Memory>,
    pub causal_context: Vec<Subgraph>,
    pub todos: Vec<TodoMarker>,
    pub matching_rules: RuleMatches,
    pub constraints: Vec<String>,
    pub opportunities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub schema_version: u32,
    pub memory_count: i64,
    pub rule_count: i64,
    pub entity_count: i64,
    pub vector_search_available: bool,
    pub global_partition_enabled: bool,
    pub watcher_running: bool,
    pub initialized: bool,
    pub last_compaction: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSnapshot {
    pub project_path: String,
    pub memories: Vec<Memory>,
    pub edges: Vec<Edge>,
    pub rules: Vec<Rule>,
    pub entities: Vec<Entity>,
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn engine(dir: &std::path::Path) -> Engine {
        let config = EngineConfig {
            storage_path: dir.join("project"),
            global_enabled: true,
            global_path: dir.join("global"),
            ..EngineConfig::from_env()
        };
        Engine::open(dir.join("repo"), config, None, None, None).unwrap()
    }

    #[tokio::test]
    async fn test_briefing_registers_initialization_token() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        let health = engine.health().await.unwrap();
        assert!(health.initialized);
    }

    #[tokio::test]
    async fn test_record_requires_context_check() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let err = engine.record(input("decision", "use sqlite for this service")).await.unwrap_err();
        assert!(matches!(err, EngineError::InitRequired { operation: "record" }));

        engine.briefing(None).await.unwrap();
        let err = engine.record(input("decision", "use sqlite for this service")).await.unwrap_err();
        assert!(matches!(err, EngineError::ContextCheckRequired { operation: "record" }));

        engine.context_check("storage backend choice").await.unwrap();
        engine.record(input("decision", "use sqlite for this service")).await.unwrap();
    }

    #[tokio::test]
    async fn test_universal_rule_is_mirrored_to_global_partition() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("validating input").await.unwrap();
        engine
            .record(input("pattern", "always validate input at the boundary, in general, regardless of language"))
            .await
            .unwrap();

        let result = engine.recall("validate input at the boundary", RecallFilters::with_limit(10)).await.unwrap();
        let hit = result.by_category.values().flatten().find(|m| m.memory.content.contains("validate input"));
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn test_file_scoped_memory_stays_local_only() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("checkout bug").await.unwrap();
        engine
            .record(RecordInput { file_path: Some("src/checkout.rs".into()), ..input("decision", "patch checkout retry logic") })
            .await
            .unwrap();

        assert_eq!(engine.health().await.unwrap().memory_count, 1);
    }

    #[tokio::test]
    async fn test_compact_dry_run_reports_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("checkpointing").await.unwrap();
        let id = engine.record(input("decision", "adopt the new retry policy")).await.unwrap().id;
        engine.seal_outcome(id, "worked as expected", true).await.unwrap();

        let result = engine.compact(10, None, true).await.unwrap();
        assert_eq!(result.archived_ids, vec![id]);
        assert!(result.summary_memory_id.is_none());
        assert_eq!(engine.health().await.unwrap().memory_count, 1);
    }

    #[tokio::test]
    async fn test_compact_archives_and_links_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("checkpointing").await.unwrap();
        let id = engine.record(input("decision", "adopt the new retry policy")).await.unwrap().id;
        engine.seal_outcome(id, "worked as expected", true).await.unwrap();

        let result = engine.compact(10, None, false).await.unwrap();
        assert!(result.summary_memory_id.is_some());
        let health = engine.health().await.unwrap();
        assert_eq!(health.memory_count, 1);

        let subgraph = engine
            .trace(result.summary_memory_id.unwrap(), Direction::Backward, None, Some(1))
            .await
            .unwrap();
        assert!(subgraph.nodes.iter().any(|n| n.id == id));
    }

    #[tokio::test]
    async fn test_compact_includes_unsealed_learning_but_not_unsealed_decision() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("checkpointing").await.unwrap();
        let unsealed_decision = engine.record(input("decision", "evaluate switching to postgres")).await.unwrap().id;
        let unsealed_learning = engine.record(input("learning", "migrations run faster in a single transaction")).await.unwrap().id;

        let result = engine.compact(10, None, true).await.unwrap();
        assert!(result.archived_ids.contains(&unsealed_learning));
        assert!(!result.archived_ids.contains(&unsealed_decision));
    }

    #[tokio::test]
    async fn test_compact_topic_scopes_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("checkpointing").await.unwrap();
        let retry = engine.record(input("learning", "retry backoff must be jittered")).await.unwrap().id;
        let unrelated = engine.record(input("learning", "css grid handles the dashboard layout")).await.unwrap().id;

        let result = engine.compact(10, Some("retry backoff"), true).await.unwrap();
        assert!(result.archived_ids.contains(&retry));
        assert!(!result.archived_ids.contains(&unrelated));
    }

    #[tokio::test]
    async fn test_find_related_includes_graph_neighbor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("queue migration").await.unwrap();
        let first = engine.record(input("decision", "migrate the queue to kafka")).await.unwrap().id;
        let second = engine.record(input("learning", "kafka needs explicit partition counts")).await.unwrap().id;
        engine.link(first, second, Relationship::LedTo, None, 1.0).await.unwrap();

        let related = engine.find_related(first, 5).await.unwrap();
        assert!(related.iter().any(|r| r.memory.id == second));
    }

    #[tokio::test]
    async fn test_export_graph_topic_seed_matches_ids_seed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("queue migration").await.unwrap();
        let first = engine.record(input("decision", "migrate the queue to kafka")).await.unwrap().id;
        let second = engine.record(input("learning", "kafka needs explicit partition counts")).await.unwrap().id;
        engine.link(first, second, Relationship::LedTo, None, 1.0).await.unwrap();

        let by_topic = engine
            .export_graph(ExportFormat::Json, ExportSeed::Topic("kafka queue migration".into()), true)
            .await
            .unwrap();
        assert!(by_topic.contains("migrate the queue to kafka"));
        assert!(by_topic.contains("kafka needs explicit partition counts"));
        assert!(by_topic.contains("led_to"));
    }

    #[tokio::test]
    async fn test_export_import_round_trip_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();
        engine.context_check("exporting").await.unwrap();
        engine.record(input("warning", "never log raw credentials")).await.unwrap();

        let snapshot = engine.export_data().await.unwrap();
        assert_eq!(snapshot.memories.len(), 1);

        let dir2 = tempfile::tempdir().unwrap();
        let engine2 = engine(dir2.path());
        engine2.briefing(None).await.unwrap();
        engine2.import_data(&snapshot, false).await.unwrap();

        let health = engine2.health().await.unwrap();
        assert_eq!(health.memory_count, 1);
    }

    #[tokio::test]
    async fn test_export_import_round_trip_preserves_code_entities() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.briefing(None).await.unwrap();

        let entity_row = EntityRow {
            id: "entity-1".to_string(),
            project_path: engine.project_path.clone(),
            file_path: "src/lib.rs".to_string(),
            qualified_name: "lib::greet".to_string(),
            name: "greet".to_string(),
            kind: "function".to_string(),
            line_start: 1,
            line_end: 3,
            signature: Some("fn greet()".to_string()),
            docstring: None,
            language: "rust".to_string(),
            imports_json: "[]".to_string(),
            inherits_json: "[]".to_string(),
            calls_json: "[]".to_string(),
        };
        engine.memory.storage().upsert_entity(&entity_row).unwrap();

        let snapshot = engine.export_data().await.unwrap();
        assert_eq!(snapshot.entities.len(), 1);

        let dir2 = tempfile::tempdir().unwrap();
        let engine2 = engine(dir2.path());
        engine2.briefing(None).await.unwrap();
        engine2.import_data(&snapshot, false).await.unwrap();

        let restored = engine2.memory.storage().list_entities_for_project(&engine2.project_path).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].qualified_name, "lib::greet");
    }

    #[test]
    fn test_chunk_by_paragraph_splits_on_blank_lines() {
        let text = "first paragraph here.\n\nsecond paragraph here.";
        let chunks = chunk_by_paragraph(text, 1000);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("first paragraph"));
        assert!(chunks[0].contains("second paragraph"));
    }

    #[test]
    fn test_chunk_by_paragraph_respects_chunk_size() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_by_paragraph(&text, 60);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_also_global_keeps_file_scoped_memories_local() {
        let record = RecordInput { file_path: Some("src/lib.rs".into()), ..input("decision", "always validate inputs") };
        assert!(!also_global(&record));
    }

    #[test]
    fn test_also_global_detects_universal_language() {
        let record = input("pattern", "always validate input at the boundary, as a rule");
        assert!(also_global(&record));
    }

    #[test]
    fn test_also_global_keeps_ticket_references_local() {
        let record = input("decision", "fixes #4821 by retrying the upload");
        assert!(!also_global(&record));
    }
}
