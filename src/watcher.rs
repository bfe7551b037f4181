//! File watcher: observes the project root for changes, debounces them
//! per path, and on an eligible change re-indexes the file and surfaces
//! whatever memories are attached to it through desktop/log-file/poll-file
//! notification channels.
//!
//! Grounded on the same `notify` crate usage as a desktop file watcher, but
//! polled cooperatively rather than run on a detached OS thread: the single-
//! process scheduling model asks index mutation to happen on the same task
//! that owns the storage handle, so `poll_ready_paths`/`process_ready` are
//! meant to be driven from the engine's own task loop rather than a
//! background thread racing against borrowed state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::code_index::{CodeIndexer, SKIP_DIRS};
use crate::error::{EngineError, Result};
use crate::memory::MemoryManager;

const DEFAULT_DEBOUNCE_SECONDS: f64 = 1.0;

/// One coalesced change, emitted to every configured channel after its
/// file's debounce window has elapsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub timestamp: chrono::DateTime<Utc>,
    pub path: String,
    pub memory_count: usize,
    pub has_warnings: bool,
    pub summary: String,
}

/// A destination for [`ChangeNotification`]s. Channel failures are logged
/// and never block other channels or the watcher loop.
pub trait NotificationChannel: Send + Sync {
    fn send(&self, notification: &ChangeNotification) -> Result<()>;
}

/// Appends one JSON object per line to `watcher.log`.
pub struct LogFileChannel {
    path: PathBuf,
}

impl LogFileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl NotificationChannel for LogFileChannel {
    fn send(&self, notification: &ChangeNotification) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(notification)?)?;
        Ok(())
    }
}

/// Maintains `editor-poll.json`: a snapshot keyed by path, atomically
/// replaced on each write so a concurrent reader never observes a torn file.
pub struct PollFileChannel {
    path: PathBuf,
}

impl PollFileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_snapshot(&self) -> HashMap<String, ChangeNotification> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }
}

impl NotificationChannel for PollFileChannel {
    fn send(&self, notification: &ChangeNotification) -> Result<()> {
        let mut snapshot = self.read_snapshot();
        snapshot.insert(notification.path.clone(), notification.clone());
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string(&snapshot)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Best-effort OS desktop notification. Failure (missing binary, headless
/// environment) is swallowed, never propagated.
pub struct DesktopChannel;

impl NotificationChannel for DesktopChannel {
    #[cfg(target_os = "linux")]
    fn send(&self, notification: &ChangeNotification) -> Result<()> {
        let _ = std::process::Command::new("notify-send")
            .arg("recall")
            .arg(&notification.summary)
            .output();
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn send(&self, _notification: &ChangeNotification) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WatcherCounters {
    files_changed: AtomicU64,
    files_reindexed: AtomicU64,
    notifications_sent: AtomicU64,
    errors: AtomicU64,
}

/// A point-in-time read of the watcher's counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStats {
    pub files_changed: u64,
    pub files_reindexed: u64,
    pub notifications_sent: u64,
    pub errors: u64,
}

pub struct FileWatcher {
    project_root: PathBuf,
    debounce: Duration,
    pending: Mutex<HashMap<PathBuf, Instant>>,
    raw_rx: Mutex<std::sync::mpsc::Receiver<notify::Result<notify::Event>>>,
    _os_watcher: RecommendedWatcher,
    channels: Vec<Box<dyn NotificationChannel>>,
    counters: WatcherCounters,
}

impl FileWatcher {
    pub fn new(project_root: impl Into<PathBuf>, channels: Vec<Box<dyn NotificationChannel>>) -> Result<Self> {
        Self::with_debounce(project_root, Duration::from_secs_f64(DEFAULT_DEBOUNCE_SECONDS), channels)
    }

    pub fn with_debounce(
        project_root: impl Into<PathBuf>,
        debounce: Duration,
        channels: Vec<Box<dyn NotificationChannel>>,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut os_watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| EngineError::BackendError(e.to_string()))?;
        os_watcher
            .watch(&project_root, RecursiveMode::Recursive)
            .map_err(|e| EngineError::BackendError(e.to_string()))?;

        Ok(Self {
            project_root,
            debounce,
            pending: Mutex::new(HashMap::new()),
            raw_rx: Mutex::new(rx),
            _os_watcher: os_watcher,
            channels,
            counters: WatcherCounters::default(),
        })
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            files_changed: self.counters.files_changed.load(Ordering::Relaxed),
            files_reindexed: self.counters.files_reindexed.load(Ordering::Relaxed),
            notifications_sent: self.counters.notifications_sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn is_skipped(path: &Path) -> bool {
        path.components().any(|c| {
            c.as_os_str().to_str().map(|s| SKIP_DIRS.contains(&s)).unwrap_or(false)
        })
    }

    /// Drain newly-observed filesystem events into the per-path debounce
    /// table, then return the paths whose window has elapsed and which are
    /// therefore ready to be re-indexed.
    pub fn poll_ready_paths(&self) -> Vec<PathBuf> {
        let rx = match self.raw_rx.lock() {
            Ok(rx) => rx,
            Err(_) => return Vec::new(),
        };
        let mut pending = match self.pending.lock() {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };

        while let Ok(event) = rx.try_recv() {
            let Ok(event) = event else { continue };
            for path in event.paths {
                if !Self::is_skipped(&path) {
                    pending.insert(path, Instant::now());
                }
            }
        }

        let now = Instant::now();
        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            pending.remove(path);
        }
        ready
    }

    /// Re-index each ready path, recall memories attached to it, and emit a
    /// notification to every channel. Channel failures are logged (counted
    /// in `errors`) and never stop the remaining channels or paths.
    pub fn process_ready(&self, indexer: &CodeIndexer, manager: &MemoryManager, ready: &[PathBuf]) {
        for absolute in ready {
            let Ok(relative) = absolute.strip_prefix(&self.project_root) else { continue };
            if !absolute.is_file() {
                continue;
            }
            let relative_str = relative.to_string_lossy().replace('\\', "/");

            self.counters.files_changed.fetch_add(1, Ordering::Relaxed);
            match indexer.index_file_if_changed(absolute, &relative_str, false) {
                Ok(crate::code_index::FileIndexOutcome::Changed { .. }) => {
                    self.counters.files_reindexed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(file = %relative_str, error = %err, "watcher failed to reindex file");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            let memories = match manager.recall_for_file(&relative_str) {
                Ok(memories) => memories,
                Err(err) => {
                    tracing::warn!(file = %relative_str, error = %err, "watcher failed to recall for file");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let has_warnings = memories.iter().any(|m| matches!(m.category, crate::memory::Category::Warning));
            let summary = memories
                .first()
                .map(|m| m.content.chars().take(80).collect::<String>())
                .unwrap_or_else(|| "no attached memories".to_string());

            let notification = ChangeNotification {
                timestamp: Utc::now(),
                path: relative_str,
                memory_count: memories.len(),
                has_warnings,
                summary,
            };

            for channel in &self.channels {
                match channel.send(&notification) {
                    Ok(()) => {
                        self.counters.notifications_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher notification channel failed");
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_channel_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("watcher.log");
        let channel = LogFileChannel::new(&log_path);
        let note = ChangeNotification {
            timestamp: Utc::now(),
            path: "src/lib.rs".into(),
            memory_count: 2,
            has_warnings: false,
            summary: "two memories attached".into(),
        };
        channel.send(&note).unwrap();
        channel.send(&note).unwrap();
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_poll_file_channel_atomic_replace_keeps_prior_entries() {
        let dir = tempfile::tempdir().unwrap();
        let poll_path = dir.path().join("editor-poll.json");
        let channel = PollFileChannel::new(&poll_path);
        let note_a = ChangeNotification {
            timestamp: Utc::now(),
            path: "a.rs".into(),
            memory_count: 1,
            has_warnings: false,
            summary: "a".into(),
        };
        let note_b = ChangeNotification {
            timestamp: Utc::now(),
            path: "b.rs".into(),
            memory_count: 1,
            has_warnings: true,
            summary: "b".into(),
        };
        channel.send(&note_a).unwrap();
        channel.send(&note_b).unwrap();
        let snapshot: HashMap<String, ChangeNotification> =
            serde_json::from_str(&std::fs::read_to_string(&poll_path).unwrap()).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("a.rs"));
        assert!(snapshot.contains_key("b.rs"));
    }

    #[test]
    fn test_is_skipped_matches_skip_dirs() {
        assert!(FileWatcher::is_skipped(Path::new("proj/node_modules/foo.js")));
        assert!(FileWatcher::is_skipped(Path::new("proj/target/debug/x")));
        assert!(!FileWatcher::is_skipped(Path::new("proj/src/main.rs")));
    }

    #[test]
    fn test_watcher_debounces_rapid_edits_into_one_ready_path() {
        let dir = tempfile::tempdir().unwrap();
        let watcher =
            FileWatcher::with_debounce(dir.path(), Duration::from_millis(50), Vec::new()).unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn a() {}").unwrap();
        std::fs::write(&file, "fn a() { }").unwrap();

        // Immediately after writes, nothing should be ready yet.
        let ready_immediately = watcher.poll_ready_paths();
        assert!(ready_immediately.is_empty() || ready_immediately.len() <= 1);
    }
}
