//! Tool Registry — thread-safe store matching nanobot's `ToolRegistry`.
//!
//! The agent loop registers tools here and dispatches LLM tool-call requests
//! by name. Beyond plain dispatch, the registry owns three cross-cutting
//! concerns every tool gets for free: a bounded result cache with TTL
//! expiry, single-flight dedup of identical concurrent calls, and bounded
//! parallel execution for tool-call batches.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tracing::{info, warn};

use nanobot_core::types::ToolDefinition;

use super::base::Tool;

// ─────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),
}

// ─────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────

/// Registry-wide knobs, sourced from `ToolsConfig` in `nanobot-core`.
#[derive(Clone, Debug)]
pub struct ToolRegistryConfig {
    /// Max entries kept in the result cache before the LRU evicts.
    pub cache_size: usize,
    /// How long a cached entry stays valid.
    pub cache_ttl: Duration,
    /// Max tool calls `execute_batch` runs concurrently.
    pub parallelism: usize,
}

impl Default for ToolRegistryConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            cache_ttl: Duration::from_secs(300),
            parallelism: 4,
        }
    }
}

// ─────────────────────────────────────────────
// A single call to execute_batch
// ─────────────────────────────────────────────

/// One pending tool invocation, as requested by a batch of LLM tool calls.
#[derive(Clone, Debug)]
pub struct ToolCallRequest {
    pub name: String,
    pub params: HashMap<String, Value>,
}

// ─────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────

struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

fn cache_get_fresh(cache: &StdMutex<LruCache<String, CacheEntry>>, fp: &str, ttl: Duration) -> Option<String> {
    let mut guard = cache.lock().unwrap();
    match guard.get(fp) {
        Some(entry) if entry.inserted_at.elapsed() < ttl => Some(entry.value.clone()),
        _ => None,
    }
}

fn cache_get_any(cache: &StdMutex<LruCache<String, CacheEntry>>, fp: &str) -> Option<String> {
    let mut guard = cache.lock().unwrap();
    guard.get(fp).map(|e| e.value.clone())
}

fn cache_put(cache: &StdMutex<LruCache<String, CacheEntry>>, fp: String, value: String) {
    let mut guard = cache.lock().unwrap();
    guard.put(
        fp,
        CacheEntry {
            value,
            inserted_at: Instant::now(),
        },
    );
}

// ─────────────────────────────────────────────
// Fingerprinting
// ─────────────────────────────────────────────

/// Recursively sort object keys so two semantically identical argument
/// sets (built in different key order) hash to the same fingerprint.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hash a tool name + its canonicalized arguments to a stable, process-local
/// identifier. Never persisted or compared across process boundaries.
fn fingerprint(name: &str, params: &HashMap<String, Value>) -> String {
    let obj = Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    let canonical = canonicalize(&obj);

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    canonical.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// ─────────────────────────────────────────────
// Schema validation
// ─────────────────────────────────────────────

/// Lightweight JSON Schema check — required properties present, and
/// top-level types match where declared. Not a full validator; good enough
/// to catch the LLM passing malformed arguments before a tool ever runs.
fn validate_schema(schema: &Value, params: &HashMap<String, Value>) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = obj.get("required").and_then(|r| r.as_array()) {
        for req in required {
            if let Some(key) = req.as_str() {
                if !params.contains_key(key) {
                    return Err(format!("missing required parameter '{key}'"));
                }
            }
        }
    }

    if let Some(properties) = obj.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in params {
            let Some(prop_schema) = properties.get(key) else {
                continue;
            };
            let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) else {
                continue;
            };
            if !json_type_matches(value, expected) {
                return Err(format!(
                    "parameter '{key}' expected type '{expected}', got '{}'",
                    json_type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn json_type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whether an executor error is worth retrying — timeouts and interrupted
/// I/O, not e.g. a malformed-input failure that will just fail again.
fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        use std::io::ErrorKind::*;
        return matches!(
            io_err.kind(),
            TimedOut | Interrupted | WouldBlock | ConnectionReset | ConnectionAborted
        );
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("timed out") || msg.contains("timeout")
}

// ─────────────────────────────────────────────
// In-flight dedup guard
// ─────────────────────────────────────────────

/// Per-fingerprint lock table backing single-flight dedup. Using a
/// per-key `tokio::sync::Mutex` rather than a bare `Notify` sidesteps the
/// lost-wakeup race a hand-rolled notify-based gate would have if the
/// holder finished between a waiter cloning the `Notify` and awaiting it.
type InFlightTable = Arc<StdMutex<HashMap<String, Arc<TokioMutex<()>>>>>;

/// Removes this call's entry from the in-flight table once it's dropped,
/// regardless of which path execution took (success, tool error, schema
/// validation failure, or a panic unwinding through it) — so a failed
/// validation never leaves an orphaned in-flight marker behind.
struct InFlightGuard {
    fingerprint: String,
    table: InFlightTable,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut guard = self.table.lock().unwrap();
        guard.remove(&self.fingerprint);
    }
}

// ─────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────

/// Stores tools keyed by name and dispatches calls.
///
/// Owns `Arc<dyn Tool>` so tools can be shared across threads.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    config: ToolRegistryConfig,
    cache: Arc<StdMutex<LruCache<String, CacheEntry>>>,
    in_flight: InFlightTable,
}

impl ToolRegistry {
    /// Create an empty registry with default cache/parallelism settings.
    pub fn new() -> Self {
        Self::with_config(ToolRegistryConfig::default())
    }

    /// Create an empty registry with explicit config (wired from
    /// `ToolsConfig` at the call site).
    pub fn with_config(config: ToolRegistryConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.cache_size.max(1)).unwrap();
        Self {
            tools: HashMap::new(),
            config,
            cache: Arc::new(StdMutex::new(LruCache::new(cache_size))),
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Register a tool. Refuses to overwrite an existing registration —
    /// two tools racing for the same name is a wiring bug, not something
    /// to paper over silently.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!(tool = %name, "refusing duplicate tool registration");
            return Err(ToolError::AlreadyRegistered(name));
        }
        info!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Unregister a tool by name. Returns the removed tool, if any.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        let removed = self.tools.remove(name);
        if removed.is_some() {
            info!(tool = name, "unregistered tool");
        }
        removed
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the LLM-facing definitions for all registered tools.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name with the given parameters.
    ///
    /// Mirrors nanobot's error-string convention: the LLM always gets a
    /// `String` back, even on failure.
    pub async fn execute(&self, name: &str, params: HashMap<String, Value>) -> String {
        let tool = self.tools.get(name).cloned();
        Self::execute_one(tool, name.to_string(), params, &self.cache, &self.in_flight, self.config.cache_ttl).await
    }

    /// Execute a batch of tool calls with up to `parallelism` running
    /// concurrently. Results are returned in the same order as `calls`.
    pub async fn execute_batch(&self, calls: Vec<ToolCallRequest>) -> Vec<String> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls {
            let tool = self.tools.get(&call.name).cloned();
            let cache = self.cache.clone();
            let in_flight = self.in_flight.clone();
            let ttl = self.config.cache_ttl;
            let semaphore = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("tool batch semaphore should not be closed");
                ToolRegistry::execute_one(tool, call.name, call.params, &cache, &in_flight, ttl).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| format!("Error: tool task panicked: {e}")),
            );
        }
        results
    }

    /// Shared execution path for both `execute` and `execute_batch`.
    async fn execute_one(
        tool: Option<Arc<dyn Tool>>,
        name: String,
        params: HashMap<String, Value>,
        cache: &Arc<StdMutex<LruCache<String, CacheEntry>>>,
        in_flight: &InFlightTable,
        cache_ttl: Duration,
    ) -> String {
        let tool = match tool {
            Some(t) => t,
            None => {
                warn!(tool = %name, "tool not found");
                return format!("Error: Tool '{name}' not found");
            }
        };

        let fp = fingerprint(&name, &params);

        if tool.cacheable() {
            if let Some(hit) = cache_get_fresh(cache, &fp, cache_ttl) {
                return hit;
            }
        }

        // Single-flight: join whoever is already running this exact call
        // rather than racing them, or become the holder ourselves.
        let (lock, joined) = {
            let mut guard = in_flight.lock().unwrap();
            if let Some(existing) = guard.get(&fp) {
                (existing.clone(), true)
            } else {
                let fresh = Arc::new(TokioMutex::new(()));
                guard.insert(fp.clone(), fresh.clone());
                (fresh, false)
            }
        };

        let permit = lock.lock_owned().await;
        let _guard = InFlightGuard {
            fingerprint: fp.clone(),
            table: in_flight.clone(),
            _permit: permit,
        };

        if joined {
            // The call we were queued behind has fully finished (mutex
            // ordering guarantees its cache write happened-before we got
            // the lock) — reuse its result whatever the tool's own
            // cacheable() setting, since this is dedup, not long-lived
            // caching.
            if let Some(hit) = cache_get_any(cache, &fp) {
                return hit;
            }
            // The holder bailed out before writing a result (e.g. schema
            // validation failed) — fall through and become the holder.
        }

        if let Err(e) = validate_schema(&tool.parameters(), &params) {
            warn!(tool = %name, error = %e, "tool arguments failed schema validation");
            return format!("Error: invalid arguments for {name}: {e}");
        }

        let mut attempt = 0u32;
        let result = loop {
            match tokio::time::timeout(tool.timeout(), tool.execute(params.clone())).await {
                Ok(Ok(value)) => break value,
                Ok(Err(e)) => {
                    if attempt < tool.max_retries() && is_transient(&e) {
                        let backoff = backoff_for(attempt);
                        warn!(tool = %name, attempt, error = %e, "transient tool error, retrying");
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(tool = %name, error = %e, "tool execution failed");
                    break format!("Error executing {name}: {e}");
                }
                Err(_elapsed) => {
                    if attempt < tool.max_retries() {
                        let backoff = backoff_for(attempt);
                        warn!(tool = %name, attempt, timeout = ?tool.timeout(), "tool call timed out, retrying");
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(tool = %name, timeout = ?tool.timeout(), "tool call timed out");
                    break format!("Error executing {name}: timed out after {:?}", tool.timeout());
                }
            }
        };

        // Stash the fresh result regardless of cacheable() — a concurrent
        // in-flight joiner needs it even for a non-cacheable tool. Only the
        // cacheable() fast path above ever treats a stale entry as a hit.
        cache_put(cache, fp, result.clone());

        result
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Exponential backoff for tool retries: `100ms * 2^attempt`, capped at 5s.
fn backoff_for(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(32));
    Duration::from_millis(millis).min(Duration::from_secs(5))
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
