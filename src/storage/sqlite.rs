//! SQLite persistence.
//!
//! Separate reader/writer connections to the same file, both opened in WAL
//! mode. Every method takes `&self`, not `&mut self` — `Storage` is
//! `Send + Sync` and callers wrap it in `Arc` rather than `Arc<Mutex<_>>`.
//! Row types here are plain persistence shapes; the domain types in
//! [`crate::memory`] and friends are built from them by the managers that
//! own serialization concerns (tags, outcome, category parsing).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, Result};

fn configure_connection(conn: &Connection, _encryption_key: Option<&str>) -> rusqlite::Result<()> {
    #[cfg(feature = "encryption")]
    {
        if let Some(key) = _encryption_key {
            if !key.is_empty() {
                conn.pragma_update(None, "key", key)?;
            }
        }
    }

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
}

/// Owner-only permissions on Unix for the database directory and file; a
/// no-op (but not an error) on other platforms.
fn harden_permissions(_path: &Path, _is_dir: bool) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if _is_dir { 0o700 } else { 0o600 };
        let _ = std::fs::set_permissions(_path, std::fs::Permissions::from_mode(mode));
    }
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad timestamp: {s}"),
                )),
            )
        })
}

// ============================================================================
// ROW TYPES
// ============================================================================

/// A persisted memory row. Field names mirror the `memories` table exactly;
/// callers convert to/from [`crate::memory::Memory`].
#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub id: i64,
    pub category: String,
    pub content: String,
    pub rationale: Option<String>,
    pub context: Option<String>,
    pub tags_json: String,
    pub keywords_json: String,
    pub file_path: Option<String>,
    pub is_permanent: bool,
    pub is_pinned: bool,
    pub is_archived: bool,
    pub outcome: Option<String>,
    pub worked: Option<bool>,
    pub outcome_sealed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when inserting a new memory; `id`/`access_count`/
/// timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMemoryRow {
    pub category: String,
    pub content: String,
    pub rationale: Option<String>,
    pub context: Option<String>,
    pub tags_json: String,
    pub keywords_json: String,
    pub file_path: Option<String>,
    pub is_permanent: bool,
}

/// A causal edge between two memories.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub id: i64,
    pub source_id: i64,
    pub target_id: i64,
    pub relationship: String,
    pub description: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// A standing project rule.
#[derive(Debug, Clone)]
pub struct RuleRow {
    pub id: i64,
    pub trigger: String,
    pub keywords_json: String,
    pub must_do_json: String,
    pub must_not_json: String,
    pub ask_first_json: String,
    pub warnings_json: String,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A code entity extracted from a parsed source file. `id` is the caller's
/// content-addressed hash, not an autoincrement key.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub project_path: String,
    pub file_path: String,
    pub qualified_name: String,
    pub name: String,
    pub kind: String,
    pub line_start: i64,
    pub line_end: i64,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub language: String,
    pub imports_json: String,
    pub inherits_json: String,
    pub calls_json: String,
}

/// The last-seen content hash of a file, used to skip unchanged files
/// during incremental indexing.
#[derive(Debug, Clone)]
pub struct FileHashRow {
    pub id: i64,
    pub project_path: String,
    pub file_path: String,
    pub content_hash: String,
    pub indexed_at: DateTime<Utc>,
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<MemoryRow> {
    let worked: Option<i64> = row.get("worked")?;
    let sealed_at: Option<String> = row.get("outcome_sealed_at")?;
    Ok(MemoryRow {
        id: row.get("id")?,
        category: row.get("category")?,
        content: row.get("content")?,
        rationale: row.get("rationale")?,
        context: row.get("context")?,
        tags_json: row.get("tags_json")?,
        keywords_json: row.get("keywords_json")?,
        file_path: row.get("file_path")?,
        is_permanent: row.get::<_, i64>("is_permanent")? != 0,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        is_archived: row.get::<_, i64>("is_archived")? != 0,
        outcome: row.get("outcome")?,
        worked: worked.map(|v| v != 0),
        outcome_sealed_at: sealed_at.and_then(|s| parse_rfc3339(&s).ok()),
        access_count: row.get("access_count")?,
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<EdgeRow> {
    Ok(EdgeRow {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relationship: row.get("relationship")?,
        description: row.get("description")?,
        confidence: row.get("confidence")?,
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get("id")?,
        trigger: row.get("trigger")?,
        keywords_json: row.get("keywords_json")?,
        must_do_json: row.get("must_do_json")?,
        must_not_json: row.get("must_not_json")?,
        ask_first_json: row.get("ask_first_json")?,
        warnings_json: row.get("warnings_json")?,
        priority: row.get("priority")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<EntityRow> {
    Ok(EntityRow {
        id: row.get("id")?,
        project_path: row.get("project_path")?,
        file_path: row.get("file_path")?,
        qualified_name: row.get("qualified_name")?,
        name: row.get("name")?,
        kind: row.get("kind")?,
        line_start: row.get("line_start")?,
        line_end: row.get("line_end")?,
        signature: row.get("signature")?,
        docstring: row.get("docstring")?,
        language: row.get("language")?,
        imports_json: row.get("imports_json")?,
        inherits_json: row.get("inherits_json")?,
        calls_json: row.get("calls_json")?,
    })
}

fn row_to_file_hash(row: &rusqlite::Row) -> rusqlite::Result<FileHashRow> {
    Ok(FileHashRow {
        id: row.get("id")?,
        project_path: row.get("project_path")?,
        file_path: row.get("file_path")?,
        content_hash: row.get("content_hash")?,
        indexed_at: parse_rfc3339(&row.get::<_, String>("indexed_at")?).unwrap_or_else(|_| Utc::now()),
    })
}

// ============================================================================
// STORAGE
// ============================================================================

/// The persistence handle for one project's `.memory-store` (or the global
/// cross-project partition, which is just another `Storage` opened at a
/// different path).
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl Storage {
    /// Open (creating if absent) the database at `path`, applying any
    /// pending migrations on the writer connection.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_key(path, None)
    }

    /// Open (creating if absent) the database at `path`, applying
    /// `encryption_key` under the `encryption` feature before running
    /// migrations.
    pub fn open_with_key(path: &Path, encryption_key: Option<&str>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            harden_permissions(parent, true);
        }

        let writer_conn = Connection::open(path)?;
        configure_connection(&writer_conn, encryption_key)?;
        super::migrations::apply_migrations(&writer_conn)?;

        if path.exists() {
            harden_permissions(path, false);
        }

        let reader_conn = Connection::open(path)?;
        configure_connection(&reader_conn, encryption_key)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory database, migrated and ready. Used by tests and by
    /// any caller that wants an ephemeral store.
    pub fn open_in_memory() -> Result<Self> {
        let writer_conn = Connection::open_in_memory()?;
        configure_connection(&writer_conn, None)?;
        super::migrations::apply_migrations(&writer_conn)?;
        let reader_conn = Connection::open_in_memory()?;
        configure_connection(&reader_conn, None)?;
        super::migrations::apply_migrations(&reader_conn)?;
        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| EngineError::Internal("writer connection lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| EngineError::Internal("reader connection lock poisoned".into()))
    }

    // -- memories ------------------------------------------------------

    pub fn insert_memory(&self, input: &NewMemoryRow) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO memories
                (category, content, rationale, context, tags_json, keywords_json,
                 file_path, is_permanent, is_pinned, is_archived, access_count,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, 0, ?9, ?9)",
            params![
                input.category,
                input.content,
                input.rationale,
                input.context,
                input.tags_json,
                input.keywords_json,
                input.file_path,
                input.is_permanent as i64,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_memory(&self, id: i64) -> Result<Option<MemoryRow>> {
        let conn = self.reader()?;
        conn.query_row("SELECT * FROM memories WHERE id = ?1", params![id], row_to_memory)
            .optional()
            .map_err(EngineError::from)
    }

    pub fn list_memories(&self, include_archived: bool) -> Result<Vec<MemoryRow>> {
        let conn = self.reader()?;
        let sql = if include_archived {
            "SELECT * FROM memories ORDER BY id"
        } else {
            "SELECT * FROM memories WHERE is_archived = 0 ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_memory)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_memories_for_file(&self, file_path: &str) -> Result<Vec<MemoryRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE file_path = ?1 AND is_archived = 0 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![file_path], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_pinned(&self, id: i64, pinned: bool) -> Result<()> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE memories SET is_pinned = ?1, updated_at = ?2 WHERE id = ?3",
            params![pinned as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    pub fn set_archived(&self, id: i64, archived: bool) -> Result<()> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE memories SET is_archived = ?1, updated_at = ?2 WHERE id = ?3",
            params![archived as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    pub fn seal_outcome(&self, id: i64, description: &str, worked: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE memories SET outcome = ?1, worked = ?2, outcome_sealed_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![description, worked as i64, now, id],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    pub fn increment_access_count(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.writer()?;
        for id in ids {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }

    pub fn delete_memory(&self, id: i64) -> Result<()> {
        let conn = self.writer()?;
        conn.execute("DELETE FROM memory_code_refs WHERE memory_id = ?1", params![id])?;
        conn.execute(
            "DELETE FROM memory_edges WHERE source_id = ?1 OR target_id = ?1",
            params![id],
        )?;
        let changed = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    /// FTS5 `bm25`-ranked keyword search over content/rationale/context/tags.
    /// Returns `(memory_id, score)` where higher is better (bm25 is negated).
    pub fn keyword_search_memories(&self, query: &str, limit: usize) -> Result<Vec<(i64, f32)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, bm25(memories_fts) AS rank FROM memories_fts
             WHERE memories_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![sanitized, limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((id, -rank as f32))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- edges -----------------------------------------------------------

    pub fn insert_edge(
        &self,
        source_id: i64,
        target_id: i64,
        relationship: &str,
        description: Option<&str>,
        confidence: f64,
    ) -> Result<i64> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO memory_edges (source_id, target_id, relationship, description, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![source_id, target_id, relationship, description, confidence, Utc::now().to_rfc3339()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                EngineError::Conflict(format!("edge {source_id}->{target_id} ({relationship}) already exists"))
            }
            other => EngineError::from(other),
        })?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_edge(&self, id: i64) -> Result<()> {
        let conn = self.writer()?;
        let changed = conn.execute("DELETE FROM memory_edges WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("edge {id}")));
        }
        Ok(())
    }

    pub fn edges_from(&self, source_id: i64) -> Result<Vec<EdgeRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM memory_edges WHERE source_id = ?1")?;
        let rows = stmt
            .query_map(params![source_id], row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn edges_touching(&self, memory_id: i64) -> Result<Vec<EdgeRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM memory_edges WHERE source_id = ?1 OR target_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![memory_id], row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every edge in the store, for `export_data`.
    pub fn list_all_edges(&self) -> Result<Vec<EdgeRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM memory_edges ORDER BY id")?;
        let rows = stmt.query_map([], row_to_edge)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- rules -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_rule(
        &self,
        trigger: &str,
        keywords_json: &str,
        must_do_json: &str,
        must_not_json: &str,
        ask_first_json: &str,
        warnings_json: &str,
        priority: i64,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO rules
                (trigger, keywords_json, must_do_json, must_not_json, ask_first_json,
                 warnings_json, priority, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            params![
                trigger,
                keywords_json,
                must_do_json,
                must_not_json,
                ask_first_json,
                warnings_json,
                priority,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_rule(
        &self,
        id: i64,
        trigger: &str,
        keywords_json: &str,
        must_do_json: &str,
        must_not_json: &str,
        ask_first_json: &str,
        warnings_json: &str,
        priority: i64,
    ) -> Result<()> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE rules SET trigger = ?1, keywords_json = ?2, must_do_json = ?3, must_not_json = ?4,
                ask_first_json = ?5, warnings_json = ?6, priority = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                trigger,
                keywords_json,
                must_do_json,
                must_not_json,
                ask_first_json,
                warnings_json,
                priority,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<RuleRow>> {
        let conn = self.reader()?;
        conn.query_row("SELECT * FROM rules WHERE id = ?1", params![id], row_to_rule)
            .optional()
            .map_err(EngineError::from)
    }

    pub fn list_rules(&self, enabled_only: bool) -> Result<Vec<RuleRow>> {
        let conn = self.reader()?;
        let sql = if enabled_only {
            "SELECT * FROM rules WHERE enabled = 1 ORDER BY priority DESC, id"
        } else {
            "SELECT * FROM rules ORDER BY priority DESC, id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_rule)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE rules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i64, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> Result<()> {
        let conn = self.writer()?;
        let changed = conn.execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    // -- code entities -----------------------------------------------------

    pub fn upsert_entity(&self, entity: &EntityRow) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO code_entities
                (id, project_path, file_path, qualified_name, name, kind, line_start,
                 line_end, signature, docstring, language, imports_json, inherits_json, calls_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                project_path = excluded.project_path,
                file_path = excluded.file_path,
                qualified_name = excluded.qualified_name,
                name = excluded.name,
                kind = excluded.kind,
                line_start = excluded.line_start,
                line_end = excluded.line_end,
                signature = excluded.signature,
                docstring = excluded.docstring,
                language = excluded.language,
                imports_json = excluded.imports_json,
                inherits_json = excluded.inherits_json,
                calls_json = excluded.calls_json",
            params![
                entity.id,
                entity.project_path,
                entity.file_path,
                entity.qualified_name,
                entity.name,
                entity.kind,
                entity.line_start,
                entity.line_end,
                entity.signature,
                entity.docstring,
                entity.language,
                entity.imports_json,
                entity.inherits_json,
                entity.calls_json,
            ],
        )?;
        self.sync_entity_fts(&conn, entity)?;
        Ok(())
    }

    /// `entities_fts` has no triggers (unlike `memories_fts`), so entity
    /// writes maintain the shadow table by hand.
    fn sync_entity_fts(&self, conn: &Connection, entity: &EntityRow) -> Result<()> {
        let rowid: i64 = conn.query_row(
            "SELECT rowid FROM code_entities WHERE id = ?1",
            params![entity.id],
            |row| row.get(0),
        )?;
        conn.execute(
            "DELETE FROM entities_fts WHERE rowid = ?1",
            params![rowid],
        )?;
        conn.execute(
            "INSERT INTO entities_fts (rowid, qualified_name, signature, docstring)
             VALUES (?1, ?2, ?3, ?4)",
            params![rowid, entity.qualified_name, entity.signature, entity.docstring],
        )?;
        Ok(())
    }

    pub fn delete_entity(&self, id: &str) -> Result<()> {
        let conn = self.writer()?;
        let rowid: Option<i64> = conn
            .query_row("SELECT rowid FROM code_entities WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if let Some(rowid) = rowid {
            conn.execute("DELETE FROM entities_fts WHERE rowid = ?1", params![rowid])?;
        }
        conn.execute("DELETE FROM code_entities WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<EntityRow>> {
        let conn = self.reader()?;
        conn.query_row("SELECT * FROM code_entities WHERE id = ?1", params![id], row_to_entity)
            .optional()
            .map_err(EngineError::from)
    }

    pub fn list_entities_for_project(&self, project_path: &str) -> Result<Vec<EntityRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM code_entities WHERE project_path = ?1 ORDER BY file_path, line_start",
        )?;
        let rows = stmt
            .query_map(params![project_path], row_to_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_entities_for_file(&self, project_path: &str, file_path: &str) -> Result<()> {
        let conn = self.writer()?;
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM code_entities WHERE project_path = ?1 AND file_path = ?2",
            )?;
            stmt.query_map(params![project_path, file_path], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        for id in &ids {
            let rowid: Option<i64> = conn
                .query_row("SELECT rowid FROM code_entities WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            if let Some(rowid) = rowid {
                conn.execute("DELETE FROM entities_fts WHERE rowid = ?1", params![rowid])?;
            }
        }
        conn.execute(
            "DELETE FROM code_entities WHERE project_path = ?1 AND file_path = ?2",
            params![project_path, file_path],
        )?;
        Ok(())
    }

    /// FTS5-ranked search over qualified_name/signature/docstring.
    pub fn keyword_search_entities(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT code_entities.id, bm25(entities_fts) AS rank
             FROM entities_fts JOIN code_entities ON code_entities.rowid = entities_fts.rowid
             WHERE entities_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![sanitized, limit as i64], |row| {
                let id: String = row.get(0)?;
                let rank: f64 = row.get(1)?;
                Ok((id, -rank as f32))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- file hashes ---------------------------------------------------

    pub fn get_file_hash(&self, project_path: &str, file_path: &str) -> Result<Option<FileHashRow>> {
        let conn = self.reader()?;
        conn.query_row(
            "SELECT * FROM file_hashes WHERE project_path = ?1 AND file_path = ?2",
            params![project_path, file_path],
            row_to_file_hash,
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub fn upsert_file_hash(&self, project_path: &str, file_path: &str, content_hash: &str) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO file_hashes (project_path, file_path, content_hash, indexed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project_path, file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at",
            params![project_path, file_path, content_hash, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_file_hashes_for_project(&self, project_path: &str) -> Result<Vec<FileHashRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM file_hashes WHERE project_path = ?1")?;
        let rows = stmt
            .query_map(params![project_path], row_to_file_hash)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_file_hash(&self, project_path: &str, file_path: &str) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "DELETE FROM file_hashes WHERE project_path = ?1 AND file_path = ?2",
            params![project_path, file_path],
        )?;
        Ok(())
    }

    // -- memory <-> code refs -----------------------------------------

    pub fn link_memory_code(&self, memory_id: i64, entity_id: &str) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT OR IGNORE INTO memory_code_refs (memory_id, entity_id) VALUES (?1, ?2)",
            params![memory_id, entity_id],
        )?;
        Ok(())
    }

    pub fn code_refs_for_memory(&self, memory_id: i64) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT entity_id FROM memory_code_refs WHERE memory_id = ?1")?;
        let rows = stmt
            .query_map(params![memory_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Reclaim space after `prune`/`cleanup_duplicates` deletes rows.
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.writer()?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// The schema version applied to this database, for `health`.
    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.reader()?;
        super::migrations::get_current_version(&conn).map_err(EngineError::from)
    }

    fn count(&self, sql: &str) -> Result<i64> {
        let conn = self.reader()?;
        conn.query_row(sql, [], |row| row.get(0)).map_err(EngineError::from)
    }

    /// Non-archived memory count, for `health`.
    pub fn memory_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM memories WHERE is_archived = 0")
    }

    /// Enabled rule count, for `health`.
    pub fn rule_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM rules WHERE enabled = 1")
    }

    /// Code entity count for `project_path`, for `health`.
    pub fn entity_count_for_project(&self, project_path: &str) -> Result<i64> {
        let conn = self.reader()?;
        conn.query_row(
            "SELECT COUNT(*) FROM code_entities WHERE project_path = ?1",
            params![project_path],
            |row| row.get(0),
        )
        .map_err(EngineError::from)
    }
}

/// Escape an FTS5 MATCH query: wrap each term in double quotes so stray
/// punctuation (`-`, `"`, `*`) in user content can't be interpreted as FTS5
/// query syntax, then join with `OR` to keep recall broad.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_memory(content: &str) -> NewMemoryRow {
        NewMemoryRow {
            category: "decision".into(),
            content: content.into(),
            rationale: None,
            context: None,
            tags_json: "[]".into(),
            keywords_json: "[]".into(),
            file_path: None,
            is_permanent: false,
        }
    }

    #[test]
    fn test_insert_and_get_memory_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        let id = storage.insert_memory(&new_memory("use postgres for the ledger")).unwrap();
        let row = storage.get_memory(id).unwrap().unwrap();
        assert_eq!(row.content, "use postgres for the ledger");
        assert!(!row.is_pinned);
        assert_eq!(row.access_count, 0);
    }

    #[test]
    fn test_pin_archive_and_seal_outcome() {
        let storage = Storage::open_in_memory().unwrap();
        let id = storage.insert_memory(&new_memory("retry with backoff")).unwrap();
        storage.set_pinned(id, true).unwrap();
        storage.set_archived(id, true).unwrap();
        storage.seal_outcome(id, "worked great", true).unwrap();

        let row = storage.get_memory(id).unwrap().unwrap();
        assert!(row.is_pinned);
        assert!(row.is_archived);
        assert_eq!(row.worked, Some(true));
        assert_eq!(row.outcome.as_deref(), Some("worked great"));
    }

    #[test]
    fn test_operations_on_missing_memory_return_not_found() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(matches!(storage.set_pinned(999, true), Err(EngineError::NotFound(_))));
        assert!(matches!(storage.delete_memory(999), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_keyword_search_memories_finds_match() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_memory(&new_memory("switched the queue to kafka for durability")).unwrap();
        storage.insert_memory(&new_memory("unrelated note about css")).unwrap();

        let hits = storage.keyword_search_memories("kafka", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_duplicate_edge_is_conflict() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.insert_memory(&new_memory("a")).unwrap();
        let b = storage.insert_memory(&new_memory("b")).unwrap();
        storage.insert_edge(a, b, "led_to", None, 1.0).unwrap();
        let err = storage.insert_edge(a, b, "led_to", None, 1.0).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn test_entity_upsert_and_fts_sync() {
        let storage = Storage::open_in_memory().unwrap();
        let entity = EntityRow {
            id: "abc123".into(),
            project_path: "/repo".into(),
            file_path: "src/lib.rs".into(),
            qualified_name: "crate::widgets::build".into(),
            name: "build".into(),
            kind: "function".into(),
            line_start: 10,
            line_end: 20,
            signature: Some("fn build() -> Widget".into()),
            docstring: None,
            language: "rust".into(),
            imports_json: "[]".into(),
            inherits_json: "[]".into(),
            calls_json: "[]".into(),
        };
        storage.upsert_entity(&entity).unwrap();
        let hits = storage.keyword_search_entities("widgets", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "abc123");

        storage.delete_entities_for_file("/repo", "src/lib.rs").unwrap();
        assert!(storage.get_entity("abc123").unwrap().is_none());
        assert!(storage.keyword_search_entities("widgets", 10).unwrap().is_empty());
    }

    #[test]
    fn test_file_hash_upsert_updates_existing_row() {
        let storage = Storage::open_in_memory().unwrap();
        storage.upsert_file_hash("/repo", "src/lib.rs", "hash1").unwrap();
        storage.upsert_file_hash("/repo", "src/lib.rs", "hash2").unwrap();
        let row = storage.get_file_hash("/repo", "src/lib.rs").unwrap().unwrap();
        assert_eq!(row.content_hash, "hash2");
    }

    #[test]
    fn test_sanitize_fts5_query_quotes_terms() {
        assert_eq!(sanitize_fts5_query("foo-bar baz"), "\"foo-bar\" OR \"baz\"");
        assert_eq!(sanitize_fts5_query(""), "");
    }
}
