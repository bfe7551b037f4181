//! Schema migrations, applied in order and tracked in `schema_version`.

/// One schema migration: a version number, a human description, and the
/// raw SQL executed via `execute_batch`.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    content TEXT NOT NULL,
    rationale TEXT,
    context TEXT,
    tags_json TEXT NOT NULL DEFAULT '[]',
    keywords_json TEXT NOT NULL DEFAULT '[]',
    file_path TEXT,
    is_permanent INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    is_archived INTEGER NOT NULL DEFAULT 0,
    outcome TEXT,
    worked INTEGER,
    outcome_sealed_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
CREATE INDEX IF NOT EXISTS idx_memories_file_path ON memories(file_path);
CREATE INDEX IF NOT EXISTS idx_memories_archived ON memories(is_archived);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content, rationale, context, tags_json,
    content='memories', content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content, rationale, context, tags_json)
    VALUES (new.id, new.content, new.rationale, new.context, new.tags_json);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content, rationale, context, tags_json)
    VALUES ('delete', old.id, old.content, old.rationale, old.context, old.tags_json);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content, rationale, context, tags_json)
    VALUES ('delete', old.id, old.content, old.rationale, old.context, old.tags_json);
    INSERT INTO memories_fts(rowid, content, rationale, context, tags_json)
    VALUES (new.id, new.content, new.rationale, new.context, new.tags_json);
END;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memory_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    relationship TEXT NOT NULL,
    description TEXT,
    confidence REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    UNIQUE(source_id, target_id, relationship)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON memory_edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON memory_edges(target_id);
"#;

const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger TEXT NOT NULL,
    keywords_json TEXT NOT NULL DEFAULT '[]',
    must_do_json TEXT NOT NULL DEFAULT '[]',
    must_not_json TEXT NOT NULL DEFAULT '[]',
    ask_first_json TEXT NOT NULL DEFAULT '[]',
    warnings_json TEXT NOT NULL DEFAULT '[]',
    priority INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS code_entities (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    file_path TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    line_start INTEGER NOT NULL,
    line_end INTEGER NOT NULL,
    signature TEXT,
    docstring TEXT,
    language TEXT NOT NULL,
    imports_json TEXT NOT NULL DEFAULT '[]',
    inherits_json TEXT NOT NULL DEFAULT '[]',
    calls_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_entities_project_file ON code_entities(project_path, file_path);
CREATE INDEX IF NOT EXISTS idx_entities_qualified_name ON code_entities(qualified_name);
CREATE INDEX IF NOT EXISTS idx_entities_name ON code_entities(name);

CREATE TABLE IF NOT EXISTS file_hashes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_path TEXT NOT NULL,
    file_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    indexed_at TEXT NOT NULL,
    UNIQUE(project_path, file_path)
);

CREATE TABLE IF NOT EXISTS memory_code_refs (
    memory_id INTEGER NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (memory_id, entity_id)
);
"#;

const MIGRATION_V5_UP: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    qualified_name, signature, docstring,
    content='code_entities', content_rowid='rowid',
    tokenize='porter ascii'
);
"#;

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "memories table, FTS5 shadow index, schema_version",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "memory_edges (causal graph)",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "rules table",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "code_entities, file_hashes, memory_code_refs",
        up: MIGRATION_V4_UP,
    },
    Migration {
        version: 5,
        description: "entities_fts shadow index for find_code",
        up: MIGRATION_V5_UP,
    },
];

/// Current schema version applied to `conn`, or 0 if unmigrated.
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply every migration with `version` greater than the current schema
/// version, recording each in `schema_version`. Returns the count applied.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let mut current = get_current_version(conn).unwrap_or(0);
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        current = migration.version;
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_apply_migrations_on_memory_db() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len() as u32);
        assert_eq!(get_current_version(&conn).unwrap(), 5);

        // second call is a no-op
        let applied_again = apply_migrations(&conn).unwrap();
        assert_eq!(applied_again, 0);
    }
}
