//! Memory system — long-term memory and daily notes.
//!
//! Port of nanobot's `agent/memory.py`.
//!
//! The agent's memory is file-based:
//! - **Long-term memory**: `workspace/memory/MEMORY.md` — persistent facts, prefs
//! - **Daily notes**: `workspace/memory/YYYY-MM-DD.md` — ephemeral daily context
//!
//! The context builder reads memory on every prompt build (passive read).
//! The agent writes memory via the filesystem tools (active write).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, warn};

// ─────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────

/// File-based memory store for the agent.
///
/// Manages `memory/MEMORY.md` (long-term) and `memory/YYYY-MM-DD.md` (daily).
pub struct MemoryStore {
    /// The `memory/` directory inside the workspace.
    memory_dir: PathBuf,
    /// Path to the long-term memory file.
    memory_file: PathBuf,
}

impl MemoryStore {
    /// Create a new memory store, creating the `memory/` directory if needed.
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let memory_dir = workspace.join("memory");
        if !memory_dir.exists() {
            std::fs::create_dir_all(&memory_dir)?;
            debug!(dir = %memory_dir.display(), "created memory directory");
        }
        let memory_file = memory_dir.join("MEMORY.md");
        Ok(Self {
            memory_dir,
            memory_file,
        })
    }

    /// Create a MemoryStore without creating the directory (for read-only checks).
    pub fn new_lazy(workspace: &Path) -> Self {
        let memory_dir = workspace.join("memory");
        let memory_file = memory_dir.join("MEMORY.md");
        Self {
            memory_dir,
            memory_file,
        }
    }

    // ────────────── Long-term memory ──────────────

    /// Read the long-term memory file. Returns empty string if absent.
    pub fn read_long_term(&self) -> String {
        std::fs::read_to_string(&self.memory_file).unwrap_or_default()
    }

    /// Overwrite the entire long-term memory file.
    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        self.ensure_dir()?;
        std::fs::write(&self.memory_file, content)
    }

    // ────────────── Daily notes ──────────────

    /// Path to today's daily notes file.
    pub fn today_file(&self) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.memory_dir.join(format!("{today}.md"))
    }

    /// Read today's daily notes. Returns empty string if absent.
    pub fn read_today(&self) -> String {
        std::fs::read_to_string(self.today_file()).unwrap_or_default()
    }

    /// Append content to today's daily notes.
    ///
    /// If the file doesn't exist, creates it with a date header first.
    pub fn append_today(&self, content: &str) -> std::io::Result<()> {
        self.ensure_dir()?;
        let path = self.today_file();
        if path.exists() {
            let mut existing = std::fs::read_to_string(&path)?;
            existing.push('\n');
            existing.push_str(content);
            std::fs::write(&path, existing)
        } else {
            let today = Utc::now().format("%Y-%m-%d").to_string();
            let initial = format!("# {today}\n\n{content}");
            std::fs::write(&path, initial)
        }
    }

    // ────────────── Aggregation ──────────────

    /// List daily note files, newest first.
    pub fn list_memory_files(&self) -> Vec<PathBuf> {
        let pattern = self.memory_dir.join("????-??-??.md");
        let pattern_str = pattern.to_string_lossy().to_string();

        let mut files: Vec<PathBuf> = glob_simple(&self.memory_dir)
            .into_iter()
            .collect();
        files.sort();
        files.reverse(); // newest first
        let _ = pattern_str; // suppress unused
        files
    }

    /// Read the last N days of daily notes, joined by `---` separators.
    pub fn get_recent_memories(&self, days: usize) -> String {
        let files = self.list_memory_files();
        let parts: Vec<String> = files
            .into_iter()
            .take(days)
            .filter_map(|f| std::fs::read_to_string(&f).ok())
            .filter(|c| !c.trim().is_empty())
            .collect();
        parts.join("\n\n---\n\n")
    }

    /// Build the memory context string for the system prompt.
    ///
    /// Returns `None` if no memory exists.
    /// Format:
    /// ```text
    /// # Memory
    ///
    /// ## Long-term Memory
    /// <content of MEMORY.md>
    ///
    /// ## Today's Notes (YYYY-MM-DD)
    /// <content of today's daily file>
    /// ```
    pub fn get_memory_context(&self) -> Option<String> {
        let mut sections = Vec::new();

        // Long-term memory
        let long_term = self.read_long_term();
        if !long_term.trim().is_empty() {
            sections.push(format!("## Long-term Memory\n\n{long_term}"));
        }

        // Today's daily notes
        let today_content = self.read_today();
        if !today_content.trim().is_empty() {
            let today = Utc::now().format("%Y-%m-%d").to_string();
            sections.push(format!("## Today's Notes ({today})\n\n{today_content}"));
        }

        if sections.is_empty() {
            None
        } else {
            Some(format!("# Memory\n\n{}", sections.join("\n\n")))
        }
    }

    /// Path to the memory directory.
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Path to the long-term memory file.
    pub fn memory_file(&self) -> &Path {
        &self.memory_file
    }

    /// Ensure the memory directory exists.
    fn ensure_dir(&self) -> std::io::Result<()> {
        if !self.memory_dir.exists() {
            std::fs::create_dir_all(&self.memory_dir)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────
// MemoryIndex
// ─────────────────────────────────────────────

/// Scope restricting a [`MemoryIndex::retrieve`] query to part of the
/// memory corpus. Long-term memory always matches regardless of scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryScope {
    /// Every daily note plus long-term memory.
    All,
    /// Only today's daily note (plus long-term memory).
    Today,
    /// A specific day, `YYYY-MM-DD` (plus long-term memory).
    Day(String),
}

impl MemoryScope {
    fn day_filter(&self) -> Option<String> {
        match self {
            MemoryScope::All => None,
            MemoryScope::Today => Some(Utc::now().format("%Y-%m-%d").to_string()),
            MemoryScope::Day(d) => Some(d.clone()),
        }
    }
}

/// Scope-aware, FTS-backed retrieval layer over a [`MemoryStore`].
///
/// The markdown files under `memory/` remain the source of truth; the
/// SQLite FTS5 index is a derived, fully rebuildable cache used only to
/// make `retrieve` faster than scanning every file. If FTS5 is unavailable
/// at runtime, retrieval degrades to a plain substring scan over the same
/// files rather than failing outright.
pub struct MemoryIndex {
    store: MemoryStore,
    conn: Mutex<Option<Connection>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryIndex {
    /// Build an index over `workspace/memory/`, creating the directory and
    /// (re)building the FTS table from whatever markdown is already there.
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let store = MemoryStore::new(workspace)?;
        let conn = Self::open_connection(&store);
        let index = Self {
            store,
            conn: Mutex::new(conn),
            write_locks: Mutex::new(HashMap::new()),
        };
        index.rebuild();
        Ok(index)
    }

    fn open_connection(store: &MemoryStore) -> Option<Connection> {
        let path = store.memory_dir().join("index.sqlite3");
        let conn = match Connection::open(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to open memory index, falling back to substring search");
                return None;
            }
        };
        if let Err(e) = conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(path, day, content);",
        ) {
            warn!(error = %e, "memory FTS5 table unavailable, falling back to substring search");
            return None;
        }
        Some(conn)
    }

    /// Rebuild the FTS index from the markdown files on disk. Idempotent:
    /// safe to call repeatedly, and always reflects current file contents
    /// (the index carries no state the files don't already have).
    pub fn rebuild(&self) {
        let mut guard = self.conn.lock().unwrap();
        let Some(conn) = guard.as_mut() else {
            return;
        };

        if let Err(e) = conn.execute("DELETE FROM memory_fts", []) {
            warn!(error = %e, "failed to clear memory index");
            return;
        }

        let long_term = self.store.read_long_term();
        if !long_term.trim().is_empty() {
            let _ = conn.execute(
                "INSERT INTO memory_fts (path, day, content) VALUES (?1, ?2, ?3)",
                rusqlite::params!["MEMORY.md", "", long_term],
            );
        }

        for file in self.store.list_memory_files() {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            let day = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let path = file.to_string_lossy().to_string();
            let _ = conn.execute(
                "INSERT INTO memory_fts (path, day, content) VALUES (?1, ?2, ?3)",
                rusqlite::params![path, day, content],
            );
        }
    }

    /// Retrieve up to `k` memory excerpts matching `query` within `scope`.
    /// Long-term memory always matches, regardless of scope.
    pub fn retrieve(&self, scope: &MemoryScope, query: &str, k: usize) -> Vec<String> {
        if query.trim().is_empty() || k == 0 {
            return Vec::new();
        }

        {
            let guard = self.conn.lock().unwrap();
            if let Some(conn) = guard.as_ref() {
                if let Some(hits) = Self::fts_search(conn, scope, query, k) {
                    return hits;
                }
            }
        }

        self.substring_fallback(scope, query, k)
    }

    fn fts_search(conn: &Connection, scope: &MemoryScope, query: &str, k: usize) -> Option<Vec<String>> {
        let match_expr = build_match_expr(query);
        if match_expr.is_empty() {
            return Some(Vec::new());
        }

        let day_filter = scope.day_filter();
        let sql = "SELECT content FROM memory_fts \
                   WHERE memory_fts MATCH ?1 AND (day = '' OR ?2 IS NULL OR day = ?2) \
                   ORDER BY rank LIMIT ?3";

        let mut stmt = conn.prepare(sql).ok()?;
        let rows = stmt
            .query_map(
                rusqlite::params![match_expr, day_filter, k as i64],
                |row| row.get::<_, String>(0),
            )
            .ok()?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(content) => out.push(content),
                Err(e) => {
                    warn!(error = %e, "memory FTS row decode failed");
                    return None;
                }
            }
        }
        Some(out)
    }

    fn substring_fallback(&self, scope: &MemoryScope, query: &str, k: usize) -> Vec<String> {
        let day_filter = scope.day_filter();
        let needle = query.to_lowercase();
        let mut out = Vec::new();

        let long_term = self.store.read_long_term();
        if !long_term.trim().is_empty() && long_term.to_lowercase().contains(&needle) {
            out.push(long_term);
        }

        for file in self.store.list_memory_files() {
            if out.len() >= k {
                break;
            }
            let day = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if let Some(ref filter) = day_filter {
                if day != filter {
                    continue;
                }
            }
            if let Ok(content) = std::fs::read_to_string(&file) {
                if content.to_lowercase().contains(&needle) {
                    out.push(content);
                }
            }
        }

        out.truncate(k);
        out
    }

    /// Append to today's daily note and keep the index in sync, serialized
    /// per-day so two concurrent writers never interleave mid-line.
    pub fn append_today(&self, content: &str) -> std::io::Result<()> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let lock = self.lock_for(&day);
        let _guard = lock.lock().unwrap();

        self.store.append_today(content)?;

        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.as_mut() {
            let path = self.store.today_file();
            let path_str = path.to_string_lossy().to_string();
            let new_content = std::fs::read_to_string(&path).unwrap_or_default();
            let _ = conn.execute(
                "DELETE FROM memory_fts WHERE path = ?1",
                rusqlite::params![path_str],
            );
            let _ = conn.execute(
                "INSERT INTO memory_fts (path, day, content) VALUES (?1, ?2, ?3)",
                rusqlite::params![path_str, day, new_content],
            );
        }
        Ok(())
    }

    /// Underlying file-based store, for callers that only need raw reads.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Build an FTS5 MATCH expression that ORs prefix matches for each token,
/// so a query like `rust project` finds notes containing either word.
fn build_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\"*"))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ─────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────

/// Simple glob for `YYYY-MM-DD.md` files in a directory.
fn glob_simple(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            // Match YYYY-MM-DD.md pattern
            name.len() == 13
                && name.ends_with(".md")
                && name.as_bytes()[4] == b'-'
                && name.as_bytes()[7] == b'-'
                && name[..4].chars().all(|c| c.is_ascii_digit())
                && name[5..7].chars().all(|c| c.is_ascii_digit())
                && name[8..10].chars().all(|c| c.is_ascii_digit())
        })
        .collect()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────


