//! # Recall Core
//!
//! Per-project semantic memory engine for AI coding assistants.
//!
//! An assistant working across many sessions on the same codebase tends to
//! relearn the same decisions, re-trip the same warnings, and lose track of
//! which files a past change touched. This crate gives it a place to put
//! that knowledge down: a typed memory store with hybrid (lexical + vector)
//! retrieval, a causal graph linking memories to each other, and a
//! content-addressed code-entity index built from incremental AST parsing.
//!
//! ## Layout
//!
//! - [`memory`] — the `Memory` type and `MemoryManager`: record, recall,
//!   seal_outcome, pin, archive, prune, cleanup_duplicates, vacuum_and_reindex.
//! - [`graph`] — `Graph`, a causal layer over memory ids with five typed
//!   relationships, cycle-safe traversal, and Mermaid/JSON export.
//! - [`code_index`] — `CodeIndexer`, multi-language AST extraction behind
//!   the [`code_index::LanguagePack`] trait, incremental re-indexing keyed
//!   on content hash, and impact analysis.
//! - [`rules`] — `RuleEngine`: natural-language triggers matched against
//!   actions via the same hybrid-search machinery as recall.
//! - [`watcher`] — debounced filesystem observation that keeps the code
//!   index current and emits change notifications.
//! - [`gate`] — the two-token protocol gate enforcing that mutating calls
//!   follow a prior `briefing`/`context_check`.
//! - [`engine`] — `Engine`, the composite-operations facade wiring the
//!   above together: briefing, context_check, compact, propose_refactor,
//!   ingest_doc, find_related, health, export_data/import_data.
//! - [`search`] — shared hybrid-fusion primitives (score normalization,
//!   tie-breaking, diversity capping) used by both recall and rule matching.
//! - [`storage`] — the SQLite persistence layer: migrations, FTS5, and
//!   row-level CRUD for memories, edges, rules, and code entities.
//! - [`lexical`] / [`vector`] — the two halves of hybrid search: an
//!   in-memory TF-IDF index and an optional HNSW vector index.
//! - [`analyzer`] — tokenization, stopword filtering, and keyword/tag
//!   inference shared across recall, rules, and the code indexer.
//! - [`collaborators`] — narrow traits (`Embedder`, git snapshot, doc
//!   fetch) for functionality explicitly kept out of the core engine.
//! - [`config`] — `EngineConfig`, environment-driven tunables.
//! - [`error`] — `EngineError`, the crate-wide error taxonomy.

pub mod analyzer;
pub mod code_index;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod graph;
pub mod lexical;
pub mod memory;
pub mod rules;
pub mod search;
pub mod storage;
pub mod vector;
pub mod watcher;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use graph::{Direction, Edge, ExportFormat, ExportSeed, Graph, Relationship};
pub use memory::{Category, Memory, MemoryManager, Outcome, RecallFilters, RecallResult, RecordInput, RecordResult, ScoredMemory};
pub use rules::{Rule, RuleEngine, RuleInput, RuleMatches};
pub use storage::Storage;

/// Common imports for consumers wiring up the engine end to end.
pub mod prelude {
    pub use crate::code_index::{CodeIndexer, Entity, LanguagePack};
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, Result};
    pub use crate::graph::{Direction, Edge, ExportFormat, ExportSeed, Graph, Relationship};
    pub use crate::memory::{Category, Memory, MemoryManager, RecallFilters, RecordInput};
    pub use crate::rules::{Rule, RuleEngine, RuleInput};
    pub use crate::storage::Storage;
}
