//! Multi-language code indexer: AST-derived entities, content-hash-gated
//! incremental re-indexing, hybrid search over entities (`find_code`), and
//! symbol-level impact analysis.
//!
//! Languages are supported through the [`LanguagePack`] trait (§9's "ship
//! parsers behind a capability trait" note) so the supported-language set is
//! configuration, not a compile-time fact — `CodeIndexer::new` takes whatever
//! packs the caller wires in.

mod languages;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::lexical::LexicalDocument;
use crate::search::{apply_diversity_cap, fuse_scores, sort_with_tiebreak, ScoredCandidate};
use crate::storage::{EntityRow, Storage};

/// Weight given to the persisted `entities_fts` bm25 signal when fusing it
/// with the freshly-rebuilt in-memory TF-IDF index in `find_code`, mirroring
/// §4.E's lexical/vector fusion with the FTS5 shadow index standing in for
/// the vector leg entities don't have. Kept low: the in-memory index is
/// rebuilt from the same rows on every call and is the more precise signal,
/// FTS5 is the crash-safe secondary one.
const ENTITY_FTS_FUSION_WEIGHT: f32 = 0.25;

/// Fallback used by `CodeIndexer::new` for callers that don't thread
/// `EngineConfig::search_diversity_max_per_file` through explicitly.
const DEFAULT_DIVERSITY_MAX_PER_FILE: usize = 3;

pub use languages::{PythonPack, RustPack};

/// Directories skipped during `index_project`'s walk and the watcher's
/// observation, matching the code indexer's hardcoded skip set.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "dist",
    "build",
    "venv",
    ".venv",
    ".memory-store",
    ".idea",
    ".vscode",
    "target",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Class,
    Function,
    Method,
    Interface,
    Import,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Class => "class",
            EntityKind::Function => "function",
            EntityKind::Method => "method",
            EntityKind::Interface => "interface",
            EntityKind::Import => "import",
        }
    }

    fn risk_weight(&self) -> u32 {
        match self {
            EntityKind::Class | EntityKind::Interface => 3,
            EntityKind::Function => 2,
            EntityKind::Method => 1,
            EntityKind::Import => 0,
        }
    }
}

/// An entity as produced by a [`LanguagePack`], before the project/file it
/// belongs to is known to the caller's extraction loop.
#[derive(Debug, Clone)]
pub struct RawEntity {
    pub kind: EntityKind,
    pub qualified_name: String,
    pub name: String,
    pub line_start: usize,
    pub line_end: usize,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub imports: Vec<String>,
    pub inherits: Vec<String>,
    pub calls: Vec<String>,
}

/// A fully-addressed code entity, as returned from storage and from
/// `find_code`/`analyze_impact`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub project_path: String,
    pub file_path: String,
    pub qualified_name: String,
    pub name: String,
    pub kind: EntityKind,
    pub line_start: i64,
    pub line_end: i64,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub language: String,
    pub imports: Vec<String>,
    pub inherits: Vec<String>,
    pub calls: Vec<String>,
}

/// A capability trait one AST parser adapter implements per language. The
/// core never assumes a fixed language set — `CodeIndexer` is handed a list
/// of packs at construction.
pub trait LanguagePack: Send + Sync {
    /// Language name stored on each emitted entity (e.g. `"rust"`).
    fn name(&self) -> &'static str;

    /// File extensions (without the dot) this pack claims, e.g. `["rs"]`.
    fn extensions(&self) -> &'static [&'static str];

    /// Parse `source` and emit every class/function/method/interface/import
    /// entity found, with qualified names resolved by walking enclosing
    /// scopes.
    fn extract(&self, source: &str) -> Result<Vec<RawEntity>>;
}

/// The lowest-16-hex-digits of SHA-256 over
/// `project | relative_path | qualified_name | kind`, deliberately excluding
/// line numbers so edits within a file do not change ids.
pub fn compute_entity_id(project_path: &str, relative_path: &str, qualified_name: &str, kind: EntityKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_path.as_bytes());
    hasher.update(b"|");
    hasher.update(relative_path.as_bytes());
    hasher.update(b"|");
    hasher.update(qualified_name.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    let digest = hasher.finalize();
    let full_hex = format!("{digest:x}");
    full_hex[full_hex.len() - 16..].to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIndexOutcome {
    Unchanged,
    Changed { entity_count: usize },
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIndexReport {
    pub files_checked: usize,
    pub files_changed: usize,
    pub files_unchanged: usize,
    pub entities_indexed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactAnalysis {
    pub entity: Entity,
    pub affected_entities: Vec<Entity>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub suggested_checks: Vec<String>,
}

pub struct CodeIndexer<'a> {
    storage: &'a Storage,
    project_path: String,
    packs: Vec<Box<dyn LanguagePack>>,
    diversity_max_per_file: usize,
}

impl<'a> CodeIndexer<'a> {
    /// `diversity_max_per_file` should come from
    /// `EngineConfig::search_diversity_max_per_file` — see
    /// [`CodeIndexer::new`]'s caller in `Engine`.
    pub fn new(storage: &'a Storage, project_path: impl Into<String>, packs: Vec<Box<dyn LanguagePack>>) -> Self {
        Self::with_diversity_cap(storage, project_path, packs, DEFAULT_DIVERSITY_MAX_PER_FILE)
    }

    pub fn with_diversity_cap(
        storage: &'a Storage,
        project_path: impl Into<String>,
        packs: Vec<Box<dyn LanguagePack>>,
        diversity_max_per_file: usize,
    ) -> Self {
        Self { storage, project_path: project_path.into(), packs, diversity_max_per_file }
    }

    fn pack_for_extension(&self, ext: &str) -> Option<&dyn LanguagePack> {
        self.packs.iter().find(|p| p.extensions().contains(&ext)).map(|p| p.as_ref())
    }

    /// Re-index `absolute_path` (given as a path relative to the project
    /// root in `relative_path`) if its content hash differs from the last
    /// indexed one, or unconditionally when `force` is set.
    pub fn index_file_if_changed(&self, absolute_path: &Path, relative_path: &str, force: bool) -> Result<FileIndexOutcome> {
        let Some(ext) = absolute_path.extension().and_then(|e| e.to_str()) else {
            return Ok(FileIndexOutcome::Skipped);
        };
        let Some(pack) = self.pack_for_extension(ext) else {
            return Ok(FileIndexOutcome::Skipped);
        };

        let content = std::fs::read_to_string(absolute_path)?;
        let hash = sha256_hex(content.as_bytes());

        if !force {
            if let Some(existing) = self.storage.get_file_hash(&self.project_path, relative_path)? {
                if existing.content_hash == hash {
                    return Ok(FileIndexOutcome::Unchanged);
                }
            }
        }

        let raw_entities = pack.extract(&content)?;
        let mut new_ids = HashSet::new();
        for raw in &raw_entities {
            let id = compute_entity_id(&self.project_path, relative_path, &raw.qualified_name, raw.kind);
            new_ids.insert(id.clone());
            let row = EntityRow {
                id,
                project_path: self.project_path.clone(),
                file_path: relative_path.to_string(),
                qualified_name: raw.qualified_name.clone(),
                name: raw.name.clone(),
                kind: raw.kind.as_str().to_string(),
                line_start: raw.line_start as i64,
                line_end: raw.line_end as i64,
                signature: raw.signature.clone(),
                docstring: raw.docstring.clone(),
                language: pack.name().to_string(),
                imports_json: serde_json::to_string(&raw.imports)?,
                inherits_json: serde_json::to_string(&raw.inherits)?,
                calls_json: serde_json::to_string(&raw.calls)?,
            };
            self.storage.upsert_entity(&row)?;
        }

        // Diff against the previously-stored entity set for this file:
        // anything not regenerated this pass has been removed from source.
        let previous = self.storage.list_entities_for_project(&self.project_path)?;
        for row in previous.into_iter().filter(|r| r.file_path == relative_path) {
            if !new_ids.contains(&row.id) {
                self.storage.delete_entity(&row.id)?;
            }
        }

        self.storage.upsert_file_hash(&self.project_path, relative_path, &hash)?;
        tracing::debug!(file = relative_path, entities = raw_entities.len(), "re-indexed file");
        Ok(FileIndexOutcome::Changed { entity_count: raw_entities.len() })
    }

    /// Walk `root` (skipping [`SKIP_DIRS`]), indexing every file whose
    /// extension a configured [`LanguagePack`] claims, then sweep away
    /// entity/hash rows for files that no longer exist on disk.
    pub fn index_project(&self, root: &Path, force: bool) -> Result<ProjectIndexReport> {
        let mut report = ProjectIndexReport::default();
        let mut seen_relative = HashSet::new();

        for entry in walkdir::WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| !is_skipped(e.path()))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let absolute = entry.path();
            let Ok(relative) = absolute.strip_prefix(root) else { continue };
            let relative_str = relative.to_string_lossy().replace('\\', "/");

            let Some(ext) = absolute.extension().and_then(|e| e.to_str()) else { continue };
            if self.pack_for_extension(ext).is_none() {
                continue;
            }

            report.files_checked += 1;
            seen_relative.insert(relative_str.clone());
            match self.index_file_if_changed(absolute, &relative_str, force) {
                Ok(FileIndexOutcome::Changed { entity_count }) => {
                    report.files_changed += 1;
                    report.entities_indexed += entity_count;
                }
                Ok(FileIndexOutcome::Unchanged) => report.files_unchanged += 1,
                Ok(FileIndexOutcome::Skipped) => {}
                Err(err) => tracing::warn!(file = %relative_str, error = %err, "failed to index file"),
            }
        }

        for hash_row in self.storage.list_file_hashes_for_project(&self.project_path)? {
            if !seen_relative.contains(&hash_row.file_path) {
                self.storage.delete_entities_for_file(&self.project_path, &hash_row.file_path)?;
                self.storage.delete_file_hash(&self.project_path, &hash_row.file_path)?;
            }
        }

        Ok(report)
    }

    /// Hybrid search over entities' `qualified_name + signature + docstring`
    /// document. No outcome/pin adjustments apply (entities carry neither);
    /// the file diversity cap still applies.
    pub fn find_code(&self, query: &str, limit: usize) -> Result<Vec<Entity>> {
        let entities = self.storage.list_entities_for_project(&self.project_path)?;
        let pool = (limit * 4).max(limit);
        let mut lexical = crate::lexical::LexicalIndex::new();
        for row in &entities {
            lexical.upsert(&row.id, &entity_document(row));
        }
        let tfidf_hits = lexical.search(query, pool);
        let fts_hits = self.storage.keyword_search_entities(query, pool)?;
        let fused = fuse_scores(&tfidf_hits, &fts_hits, ENTITY_FTS_FUSION_WEIGHT);

        let mut candidates: Vec<ScoredCandidate> = Vec::new();
        let by_id: std::collections::HashMap<&str, &EntityRow> =
            entities.iter().map(|r| (r.id.as_str(), r)).collect();
        for (id, score) in &fused {
            let Some(row) = by_id.get(id.as_str()) else { continue };
            candidates.push(ScoredCandidate {
                id: id.clone(),
                score: *score,
                file_path: Some(row.file_path.clone()),
                access_count: 0,
                created_at_unix: 0,
                tie_break_id: 0,
            });
        }
        sort_with_tiebreak(&mut candidates);
        let capped = apply_diversity_cap(candidates, self.diversity_max_per_file);

        let mut out = Vec::new();
        for candidate in capped.into_iter().take(limit) {
            if let Some(row) = by_id.get(candidate.id.as_str()) {
                out.push(entity_from_row((*row).clone())?);
            }
        }
        Ok(out)
    }

    /// Resolve `entity_name` (exact qualified-name match, then name match,
    /// then substring fuzzy match) and compute an impact analysis for each
    /// resolved entity against the project's full entity set.
    pub fn analyze_impact(&self, entity_name: &str) -> Result<Vec<ImpactAnalysis>> {
        let entities = self.storage.list_entities_for_project(&self.project_path)?;

        let mut matches: Vec<&EntityRow> =
            entities.iter().filter(|r| r.qualified_name == entity_name).collect();
        if matches.is_empty() {
            matches = entities.iter().filter(|r| r.name == entity_name).collect();
        }
        if matches.is_empty() {
            matches = entities.iter().filter(|r| r.qualified_name.contains(entity_name)).collect();
        }

        let mut analyses = Vec::new();
        for row in matches {
            let affected: Vec<&EntityRow> = entities
                .iter()
                .filter(|other| other.id != row.id && references(other, &row.qualified_name, &row.name))
                .collect();

            let affected_files: HashSet<&str> = affected.iter().map(|e| e.file_path.as_str()).collect();
            let kind = parse_kind(&row.kind).unwrap_or(EntityKind::Function);

            let mut score = kind.risk_weight();
            score += if affected_files.len() > 10 {
                4
            } else if affected_files.len() > 5 {
                2
            } else {
                0
            };
            score += if affected.len() > 20 {
                4
            } else if affected.len() > 10 {
                2
            } else {
                0
            };

            let risk_level = if score >= 8 {
                RiskLevel::High
            } else if score >= 4 {
                RiskLevel::Medium
            } else {
                RiskLevel::Low
            };

            let mut suggested_checks = vec![format!("test {}", row.file_path)];
            if matches!(risk_level, RiskLevel::High) {
                suggested_checks.push("run full test suite".to_string());
            }
            for file in affected_files.iter().take(5) {
                suggested_checks.push(format!("review {file}"));
            }

            analyses.push(ImpactAnalysis {
                entity: entity_from_row(row.clone())?,
                affected_entities: affected
                    .into_iter()
                    .map(|e| entity_from_row(e.clone()))
                    .collect::<Result<Vec<_>>>()?,
                risk_score: score,
                risk_level,
                suggested_checks,
            });
        }
        Ok(analyses)
    }
}

fn references(candidate: &EntityRow, qualified_name: &str, name: &str) -> bool {
    let lists = [&candidate.imports_json, &candidate.inherits_json, &candidate.calls_json];
    for list_json in lists {
        let list: Vec<String> = serde_json::from_str(list_json).unwrap_or_default();
        if list.iter().any(|entry| entry == qualified_name || entry == name) {
            return true;
        }
    }
    false
}

fn entity_document(row: &EntityRow) -> LexicalDocument {
    LexicalDocument {
        content: format!(
            "{} {} {}",
            row.qualified_name,
            row.signature.as_deref().unwrap_or(""),
            row.docstring.as_deref().unwrap_or("")
        ),
        rationale: String::new(),
        tags: Vec::new(),
        context: String::new(),
        file_path: Some(row.file_path.clone()),
        category: row.kind.clone(),
    }
}

fn parse_kind(s: &str) -> Option<EntityKind> {
    match s {
        "class" => Some(EntityKind::Class),
        "function" => Some(EntityKind::Function),
        "method" => Some(EntityKind::Method),
        "interface" => Some(EntityKind::Interface),
        "import" => Some(EntityKind::Import),
        _ => None,
    }
}

fn entity_from_row(row: EntityRow) -> Result<Entity> {
    let kind = parse_kind(&row.kind)
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
        imports: serde_json::from_str(&row.imports_json).unwrap_or_default(),
        inherits: serde_json::from_str(&row.inherits_json).unwrap_or_default(),
        calls: serde_json::from_str(&row.calls_json).unwrap_or_default(),
    })
}

fn is_skipped(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| SKIP_DIRS.contains(&name))
        .unwrap_or(false)
}

/// A project-wide scan for TODO/FIXME/HACK comment markers. Not part of
/// §4.H proper, but the natural counterpart to its file walk, and named in
/// §6's operations surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoMarker {
    pub file_path: String,
    pub line: usize,
    pub marker: String,
    pub text: String,
}

const TODO_MARKERS: &[&str] = &["TODO", "FIXME", "HACK"];

pub fn scan_todos(root: &Path) -> Result<Vec<TodoMarker>> {
    let mut todos = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().filter_entry(|e| !is_skipped(e.path())) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else { continue };
        let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
        for (idx, line) in content.lines().enumerate() {
            for marker in TODO_MARKERS {
                if let Some(pos) = line.find(marker) {
                    todos.push(TodoMarker {
                        file_path: relative.to_string_lossy().replace('\\', "/"),
                        line: idx + 1,
                        marker: marker.to_string(),
                        text: line[pos..].trim().to_string(),
                    });
                    break;
                }
            }
        }
    }
    Ok(todos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn indexer(storage: &Storage) -> CodeIndexer<'_> {
        CodeIndexer::new(storage, "proj", vec![Box::new(RustPack), Box::new(PythonPack)])
    }

    #[test]
    fn test_compute_entity_id_excludes_line_numbers() {
        let id_a = compute_entity_id("proj", "a.rs", "UserService::authenticate", EntityKind::Method);
        let id_b = compute_entity_id("proj", "a.rs", "UserService::authenticate", EntityKind::Method);
        assert_eq!(id_a, id_b);
        assert_eq!(id_a.len(), 16);
    }

    #[test]
    fn test_index_file_if_changed_detects_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.rs");
        std::fs::write(&file, "fn add(a: i32, b: i32) -> i32 { a + b }").unwrap();

        let storage = Storage::open_in_memory().unwrap();
        let idx = indexer(&storage);
        let first = idx.index_file_if_changed(&file, "lib.rs", false).unwrap();
        assert!(matches!(first, FileIndexOutcome::Changed { .. }));

        let second = idx.index_file_if_changed(&file, "lib.rs", false).unwrap();
        assert_eq!(second, FileIndexOutcome::Unchanged);
    }

    #[test]
    fn test_index_project_sweeps_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn one() {}").unwrap();

        let storage = Storage::open_in_memory().unwrap();
        let idx = indexer(&storage);
        let first = idx.index_project(dir.path(), false).unwrap();
        assert_eq!(first.files_changed, 1);

        std::fs::remove_file(&file).unwrap();
        let second = idx.index_project(dir.path(), false).unwrap();
        assert_eq!(second.files_checked, 0);
        assert!(storage.list_entities_for_project("proj").unwrap().is_empty());
    }

    #[test]
    fn test_analyze_impact_finds_cross_file_import_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shape.rs"), "pub trait Shape { fn area(&self) -> f64; }").unwrap();
        std::fs::write(
            dir.path().join("consumer.rs"),
            "use crate::shape::Shape;\n\nfn describe(s: &dyn Shape) -> f64 { s.area() }",
        )
        .unwrap();

        let storage = Storage::open_in_memory().unwrap();
        let idx = indexer(&storage);
        idx.index_project(dir.path(), false).unwrap();

        let analyses = idx.analyze_impact("Shape").unwrap();
        assert_eq!(analyses.len(), 1);
        let analysis = &analyses[0];
        assert!(analysis.affected_entities.iter().any(|e| e.name == "describe"));
    }

    #[test]
    fn test_analyze_impact_finds_same_file_trait_impl() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("circle.rs"),
            "trait Shape { fn area(&self) -> f64; }\n\nstruct Circle;\n\nimpl Shape for Circle { fn area(&self) -> f64 { 1.0 } }",
        )
        .unwrap();

        let storage = Storage::open_in_memory().unwrap();
        let idx = indexer(&storage);
        idx.index_project(dir.path(), false).unwrap();

        let analyses = idx.analyze_impact("Shape").unwrap();
        assert_eq!(analyses.len(), 1);
        assert!(analyses[0].affected_entities.iter().any(|e| e.name == "Circle"));
    }

    #[test]
    fn test_scan_todos_finds_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "// TODO: refactor this\nfn f() {}").unwrap();
        let todos = scan_todos(dir.path()).unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].marker, "TODO");
    }
}
