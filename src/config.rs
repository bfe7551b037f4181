//! Environment-driven configuration.
//!
//! Consolidates the scattered `std::env::var` reads the storage and
//! embedding layers would otherwise each do for themselves into one typed
//! constructor, following the precedent of `directories::ProjectDirs` for
//! platform defaults. Every variable is prefixed `RECALL_`, matching the
//! teacher's `VESTIGE_`-prefixed convention.

use std::path::PathBuf;

/// Engine-wide tunables, read once at startup via [`EngineConfig::from_env`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for this project's `.memory-store`. Defaults to
    /// `<cwd>/.memory-store`.
    pub storage_path: PathBuf,
    /// Weight `w` given to the vector score in hybrid fusion, in [0, 1].
    pub hybrid_vector_weight: f32,
    /// Maximum memories returned per `file_path` in a single search result.
    pub search_diversity_max_per_file: usize,
    /// Optional embedding model identifier, consumed by the configured
    /// `Embedder` implementation.
    pub embedding_model: Option<String>,
    /// Whether the file watcher starts automatically.
    pub watcher_enabled: bool,
    /// Per-path debounce window for the file watcher, in seconds.
    pub watcher_debounce_seconds: f64,
    /// Whether the watcher attempts best-effort desktop notifications.
    pub watcher_system_notifications: bool,
    /// Whether the global cross-project partition is consulted.
    pub global_enabled: bool,
    /// On-disk path for the global partition's store.
    pub global_path: PathBuf,
    /// Whether `record` may write into the global partition.
    pub global_write_enabled: bool,
    /// TTL for context-check tokens, in seconds.
    pub context_token_ttl_seconds: u64,
    /// Whether `index_project` should skip unchanged files via content hash.
    pub index_incremental: bool,
    /// Similarity threshold above which `record` reports a conflict
    /// candidate. Spec treats the source's hardcoded 0.75 as configurable.
    pub conflict_similarity_threshold: f32,
    /// SQLCipher key applied to the on-disk database under the `encryption`
    /// feature. `None` (or empty) leaves the database unencrypted.
    pub encryption_key: Option<String>,
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            storage_path: env_path("RECALL_STORAGE_PATH", default_storage_path()),
            hybrid_vector_weight: env_f32("RECALL_HYBRID_VECTOR_WEIGHT", 0.3),
            search_diversity_max_per_file: env_usize("RECALL_SEARCH_DIVERSITY_MAX_PER_FILE", 3),
            embedding_model: std::env::var("RECALL_EMBEDDING_MODEL").ok(),
            watcher_enabled: env_bool("RECALL_WATCHER_ENABLED", false),
            watcher_debounce_seconds: env_f64("RECALL_WATCHER_DEBOUNCE_SECONDS", 1.0),
            watcher_system_notifications: env_bool("RECALL_WATCHER_SYSTEM_NOTIFICATIONS", true),
            global_enabled: env_bool("RECALL_GLOBAL_ENABLED", true),
            global_path: env_path("RECALL_GLOBAL_PATH", default_global_path()),
            global_write_enabled: env_bool("RECALL_GLOBAL_WRITE_ENABLED", true),
            context_token_ttl_seconds: env_u64("RECALL_CONTEXT_TOKEN_TTL_SECONDS", 300),
            index_incremental: env_bool("RECALL_INDEX_INCREMENTAL", true),
            conflict_similarity_threshold: env_f32("RECALL_CONFLICT_SIMILARITY_THRESHOLD", 0.75),
            encryption_key: std::env::var("RECALL_ENCRYPTION_KEY").ok().filter(|v| !v.is_empty()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_storage_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".memory-store")
}

fn default_global_path() -> PathBuf {
    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join(".memory-store/storage");
    }
    PathBuf::from(".memory-store-global/storage")
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let cfg = EngineConfig {
            storage_path: default_storage_path(),
            hybrid_vector_weight: 0.3,
            search_diversity_max_per_file: 3,
            embedding_model: None,
            watcher_enabled: false,
            watcher_debounce_seconds: 1.0,
            watcher_system_notifications: true,
            global_enabled: true,
            global_path: default_global_path(),
            global_write_enabled: true,
            context_token_ttl_seconds: 300,
            index_incremental: true,
            conflict_similarity_threshold: 0.75,
            encryption_key: None,
        };
        assert_eq!(cfg.context_token_ttl_seconds, 300);
        assert!((cfg.conflict_similarity_threshold - 0.75).abs() < f32::EPSILON);
    }
}
