//! Session persistence and caching.
//!
//! File format: JSONL in `~/.nanobot/sessions/{safe_key}.jsonl`
//! - Line 1: `{"_type":"metadata","key":"...","created_at":"...","metadata":{}}`
//! - Line 2+: `{"role":"user","content":"hello","timestamp":"..."}`
//!
//! New messages are appended, never rewritten — only `clear()` (which
//! truncates the whole conversation) rewrites the file, and does so via a
//! temp-file-then-rename so a crash mid-write can't leave a half-written
//! session behind. `updated_at` for listing purposes comes from the file's
//! mtime rather than a line that would otherwise need rewriting on every
//! append.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Message, Session};
use crate::utils;

/// Default number of sessions kept warm in memory at once.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

// ─────────────────────────────────────────────
// Session metadata (first line of JSONL)
// ─────────────────────────────────────────────

/// Metadata header written as the first line of each JSONL session file.
#[derive(Debug, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "_type")]
    record_type: String,
    /// Original session key, kept verbatim so the on-disk safe-key mapping
    /// can be reversed and collisions detected without guessing.
    #[serde(default)]
    key: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

struct CacheEntry {
    session: Session,
    /// mtime of the file when this entry was last loaded from disk, used to
    /// detect an out-of-process write (another gateway instance, manual
    /// edit) and force a reload instead of serving stale state.
    loaded_mtime: Option<SystemTime>,
}

// ─────────────────────────────────────────────
// SessionManager
// ─────────────────────────────────────────────

/// Manages conversation sessions with in-memory caching and JSONL persistence.
///
/// Thread-safe via `RwLock` for the cache and a per-key `Mutex` for file
/// writes, so two writers for different sessions never block each other.
pub struct SessionManager {
    /// Directory where `.jsonl` session files are stored.
    sessions_dir: PathBuf,
    /// In-memory cache of active sessions, bounded to `capacity` entries.
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// Recency order, most-recently-used at the back.
    lru: Mutex<VecDeque<String>>,
    capacity: usize,
    /// Per-key write locks, so concurrent `add_message` calls for the same
    /// key serialize while different keys proceed independently.
    write_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl SessionManager {
    /// Create a new session manager.
    ///
    /// `sessions_dir` defaults to `~/.nanobot/sessions/` if `None`.
    /// The directory is created if it doesn't exist.
    pub fn new(sessions_dir: Option<PathBuf>) -> std::io::Result<Self> {
        Self::with_capacity(sessions_dir, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new session manager with an explicit in-memory cache bound.
    pub fn with_capacity(sessions_dir: Option<PathBuf>, capacity: usize) -> std::io::Result<Self> {
        let dir = sessions_dir.unwrap_or_else(utils::get_sessions_path);
        std::fs::create_dir_all(&dir)?;

        Ok(SessionManager {
            sessions_dir: dir,
            cache: RwLock::new(HashMap::new()),
            lru: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Get an existing session or create a new one.
    ///
    /// 1. Check in-memory cache (reloading if the file changed on disk).
    /// 2. Try to load from disk.
    /// 3. Create new empty session.
    pub fn get_or_create(&self, key: &str) -> Session {
        let path = self.session_path(key);
        let disk_mtime = file_mtime(&path);

        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(key) {
                if entry.loaded_mtime == disk_mtime {
                    let session = entry.session.clone();
                    drop(cache);
                    self.touch(key);
                    return session;
                }
            }
        }

        if let Some(session) = self.load_from_disk(key) {
            self.insert_cache(key, session.clone(), disk_mtime);
            return session;
        }

        let session = Session::new(key);
        self.insert_cache(key, session.clone(), None);
        session
    }

    /// Add a message to a session, appending it to disk without rewriting
    /// the rest of the file.
    pub fn add_message(&self, key: &str, message: Message) {
        let mut session = self.get_or_create(key);
        session.messages.push(message.clone());
        session.updated_at = Utc::now();

        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap();

        let path = self.session_path(key);
        let needs_header = !path.exists();
        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            if needs_header {
                let meta = SessionMetadata {
                    record_type: "metadata".to_string(),
                    key: key.to_string(),
                    created_at: session.created_at,
                    metadata: session.metadata.clone(),
                };
                writeln!(file, "{}", serde_json::to_string(&meta)?)?;
            }
            writeln!(file, "{}", serde_json::to_string(&message)?)?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!("Failed to persist session {}: {}", key, e);
        }

        let mtime = file_mtime(&path);
        drop(_guard);
        self.insert_cache(key, session, mtime);
    }

    /// Get the last `max_messages` from a session's history.
    ///
    /// Returns messages in LLM format (role + content).
    pub fn get_history(&self, key: &str, max_messages: usize) -> Vec<Message> {
        let session = self.get_or_create(key);
        let len = session.messages.len();
        if len <= max_messages {
            session.messages
        } else {
            session.messages[len - max_messages..].to_vec()
        }
    }

    /// Clear all messages in a session (reset conversation).
    ///
    /// Unlike `add_message`, this rewrites the whole file — via a temp file
    /// plus atomic rename so a crash mid-write never leaves a truncated,
    /// unparseable session on disk.
    pub fn clear(&self, key: &str) {
        let mut session = self.get_or_create(key);
        session.messages.clear();
        session.updated_at = Utc::now();

        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap();

        if let Err(e) = self.save_to_disk_atomic(&session) {
            warn!("Failed to persist cleared session {}: {}", key, e);
        }

        let path = self.session_path(key);
        let mtime = file_mtime(&path);
        drop(_guard);
        self.insert_cache(key, session, mtime);
    }

    /// Delete a session entirely (from cache and disk).
    ///
    /// Returns `true` if the session file existed on disk.
    pub fn delete(&self, key: &str) -> bool {
        {
            let mut cache = self.cache.write().unwrap();
            cache.remove(key);
        }
        {
            let mut lru = self.lru.lock().unwrap();
            lru.retain(|k| k != key);
        }

        let path = self.session_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to delete session file: {}", e);
                return false;
            }
            debug!("Deleted session file: {}", path.display());
            true
        } else {
            false
        }
    }

    /// List all sessions from disk.
    ///
    /// Returns a list of session summaries sorted by `updated_at` (newest first).
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();

        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read sessions directory: {}", e);
                return summaries;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "jsonl") {
                continue;
            }

            let Some(meta) = read_metadata(&path) else {
                continue;
            };
            let updated_at = file_mtime(&path)
                .map(DateTime::<Utc>::from)
                .unwrap_or(meta.created_at);

            summaries.push(SessionSummary {
                key: meta.key,
                created_at: meta.created_at,
                updated_at,
                path: path.clone(),
            });
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    // ─────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────

    /// Get (or create) the write lock for a key.
    fn lock_for(&self, key: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    fn touch(&self, key: &str) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|k| k != key);
        lru.push_back(key.to_string());
    }

    fn insert_cache(&self, key: &str, session: Session, mtime: Option<SystemTime>) {
        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(
                key.to_string(),
                CacheEntry {
                    session,
                    loaded_mtime: mtime,
                },
            );
        }
        self.touch(key);
        self.evict_if_needed();
    }

    fn evict_if_needed(&self) {
        let mut lru = self.lru.lock().unwrap();
        while lru.len() > self.capacity {
            if let Some(oldest) = lru.pop_front() {
                let mut cache = self.cache.write().unwrap();
                cache.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Get the JSONL file path for a session key, disambiguating collisions
    /// between distinct keys that map to the same strict safe-key by
    /// suffixing a short stable hash of the full key.
    fn session_path(&self, key: &str) -> PathBuf {
        let safe = utils::safe_key_strict(key);
        let candidate = self.sessions_dir.join(format!("{}.jsonl", safe));

        match read_metadata(&candidate) {
            Some(meta) if meta.key == key || meta.key.is_empty() => candidate,
            Some(_) => {
                let disambiguated = format!("{}_{}", safe, utils::short_hash(key));
                self.sessions_dir.join(format!("{}.jsonl", disambiguated))
            }
            None => candidate,
        }
    }

    /// Load a session from a JSONL file.
    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }

        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open session file {}: {}", path.display(), e);
                return None;
            }
        };

        let reader = std::io::BufReader::new(file);
        let mut session = Session::new(key);
        let mut messages = Vec::new();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };

            if line.trim().is_empty() {
                continue;
            }

            if let Ok(meta) = serde_json::from_str::<SessionMetadata>(&line) {
                if meta.record_type == "metadata" {
                    session.created_at = meta.created_at;
                    session.metadata = meta.metadata;
                    continue;
                }
            }

            if let Ok(msg) = serde_json::from_str::<Message>(&line) {
                messages.push(msg);
            }
        }

        session.messages = messages;
        debug!(
            "Loaded session '{}' with {} messages from disk",
            key,
            session.messages.len()
        );
        Some(session)
    }

    /// Rewrite a session file from scratch via temp-file + rename.
    fn save_to_disk_atomic(&self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);
        let tmp_path = path.with_extension("jsonl.tmp");

        {
            let mut file = std::fs::File::create(&tmp_path)?;

            let meta = SessionMetadata {
                record_type: "metadata".to_string(),
                key: session.key.clone(),
                created_at: session.created_at,
                metadata: session.metadata.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&meta)?)?;

            for msg in &session.messages {
                writeln!(file, "{}", serde_json::to_string(msg)?)?;
            }
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, &path)?;
        debug!(
            "Saved session '{}' ({} messages) to {}",
            session.key,
            session.messages.len(),
            path.display()
        );
        Ok(())
    }
}

fn read_metadata(path: &Path) -> Option<SessionMetadata> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    serde_json::from_str::<SessionMetadata>(line.trim()).ok()
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// Summary of a session for listing purposes.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    /// Session key (e.g. `"telegram:12345"`).
    pub key: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
    /// Path to the JSONL file.
    pub path: PathBuf,
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
