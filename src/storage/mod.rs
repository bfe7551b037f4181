//! Persistence layer: SQLite with schema migrations, a scoped session
//! abstraction (project-path partitioning), and row-level CRUD for
//! memories, edges, rules, code entities, and file hashes.

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{
    sanitize_fts5_query, EdgeRow, EntityRow, FileHashRow, MemoryRow, NewMemoryRow, RuleRow,
    Storage,
};
