//! Two-tier cache store for fetched artifacts.
//!
//! Fast tier: in-process map of immutable `Arc<CacheEntry>` values, replaced
//! wholesale on write so concurrent readers never observe a half-written
//! entry. Durable tier: a local SQLite table that survives restarts. The
//! durable tier is strictly best-effort: any failure there (open, read,
//! write, corrupt payload, schema mismatch) degrades to a miss or a no-op
//! and is never surfaced to callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::records::{DailyStat, VisitRecord, YearlyStat};

/// Which subset of a transformed dataset an entry holds. A read request
/// must name the same kind the entry was written with; a lite artifact can
/// never shadow a full one because the kind is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Full,
    DailyLite,
    DailyPlusAgg,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Full => "full",
            ArtifactKind::DailyLite => "daily-lite",
            ArtifactKind::DailyPlusAgg => "daily-plus-agg",
        }
    }

    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Full,
        ArtifactKind::DailyLite,
        ArtifactKind::DailyPlusAgg,
    ];
}

/// HTTP validators plus a body content signature, carried into conditional
/// revalidation requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_signature: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none() && self.content_signature.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub artifact_kind: ArtifactKind,
    pub validators: Validators,
    /// Epoch seconds at write time. Excluded from round-trip equality.
    pub stored_at: i64,
    pub records: Vec<VisitRecord>,
    pub daily_stats: Vec<DailyStat>,
    pub yearly_stats: Option<Vec<YearlyStat>>,
}

/// Which tier served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Durable,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Durable => "durable",
        }
    }
}

/// Tier order for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Check the fast tier, fall back to the durable tier and backfill the
    /// fast tier on a hit.
    #[default]
    MemoryFirst,
    /// Check the durable tier first. Useful right after a cold start, when
    /// the fast tier is empty anyway.
    PersistentFirst,
    /// Skip the durable tier entirely; only the fast tier is consulted.
    NetworkFirst,
}

pub struct CacheStore {
    namespace: String,
    schema_version: u32,
    memory: Mutex<HashMap<String, Arc<CacheEntry>>>,
    durable: Option<Mutex<Connection>>,
}

impl CacheStore {
    /// Open the store. A durable tier that cannot be opened or initialized
    /// leaves the store running memory-only.
    pub fn open(namespace: &str, sqlite_path: &str, schema_version: u32) -> Self {
        let durable = match Self::open_durable(sqlite_path) {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Cache,
                    "durable_tier_unavailable",
                    obj(&[("path", v_str(sqlite_path)), ("error", v_str(&err.to_string()))]),
                );
                None
            }
        };
        Self {
            namespace: namespace.to_string(),
            schema_version,
            memory: Mutex::new(HashMap::new()),
            durable,
        }
    }

    fn open_durable(path: &str) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                artifact_kind TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            );",
        )?;
        Ok(conn)
    }

    fn key(&self, url: &str, kind: ArtifactKind) -> String {
        format!("{}:{}::{}", self.namespace, percent_encode(url), kind.as_str())
    }

    fn key_prefix(&self, url: &str) -> String {
        format!("{}:{}::", self.namespace, percent_encode(url))
    }

    /// Read an entry. Returns None on a miss, a schema/kind mismatch, or
    /// any durable-tier failure.
    pub fn read(&self, url: &str, kind: ArtifactKind, policy: CachePolicy) -> Option<Arc<CacheEntry>> {
        self.read_traced(url, kind, policy).map(|(entry, _)| entry)
    }

    /// Like `read`, but also reports which tier served the hit.
    pub fn read_traced(
        &self,
        url: &str,
        kind: ArtifactKind,
        policy: CachePolicy,
    ) -> Option<(Arc<CacheEntry>, CacheTier)> {
        let key = self.key(url, kind);
        match policy {
            CachePolicy::MemoryFirst => self
                .read_memory(&key, kind)
                .map(|e| (e, CacheTier::Memory))
                .or_else(|| {
                    self.read_durable_and_backfill(&key, kind)
                        .map(|e| (e, CacheTier::Durable))
                }),
            CachePolicy::PersistentFirst => self
                .read_durable_and_backfill(&key, kind)
                .map(|e| (e, CacheTier::Durable))
                .or_else(|| self.read_memory(&key, kind).map(|e| (e, CacheTier::Memory))),
            CachePolicy::NetworkFirst => {
                self.read_memory(&key, kind).map(|e| (e, CacheTier::Memory))
            }
        }
    }

    fn read_memory(&self, key: &str, kind: ArtifactKind) -> Option<Arc<CacheEntry>> {
        let memory = self.memory.lock().ok()?;
        let entry = memory.get(key)?.clone();
        if entry.schema_version != self.schema_version || entry.artifact_kind != kind {
            return None;
        }
        Some(entry)
    }

    fn read_durable_and_backfill(&self, key: &str, kind: ArtifactKind) -> Option<Arc<CacheEntry>> {
        let entry = self.read_durable(key, kind)?;
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key.to_string(), entry.clone());
        }
        Some(entry)
    }

    fn read_durable(&self, key: &str, kind: ArtifactKind) -> Option<Arc<CacheEntry>> {
        let conn = self.durable.as_ref()?.lock().ok()?;
        let payload: String = conn
            .query_row(
                "SELECT payload FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok()?;
        let entry: CacheEntry = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(err) => {
                // Corrupt durable entry: treat as a miss, drop the row.
                log(
                    Level::Warn,
                    Domain::Cache,
                    "corrupt_entry_dropped",
                    obj(&[("key", v_str(key)), ("error", v_str(&err.to_string()))]),
                );
                let _ = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]);
                return None;
            }
        };
        if entry.schema_version != self.schema_version || entry.artifact_kind != kind {
            return None;
        }
        Some(Arc::new(entry))
    }

    /// Write an entry to both tiers. The fast-tier write always happens;
    /// a durable-tier failure does not roll it back.
    pub fn write(&self, url: &str, kind: ArtifactKind, entry: CacheEntry) {
        let key = self.key(url, kind);
        let entry = Arc::new(entry);
        if let Ok(mut memory) = self.memory.lock() {
            memory.insert(key.clone(), entry.clone());
        }
        self.write_durable(&key, &entry);
    }

    fn write_durable(&self, key: &str, entry: &CacheEntry) {
        let Some(durable) = self.durable.as_ref() else {
            return;
        };
        let Ok(conn) = durable.lock() else {
            return;
        };
        let payload = match serde_json::to_string(entry) {
            Ok(p) => p,
            Err(_) => return,
        };
        let result = conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, schema_version, artifact_kind, stored_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key,
                entry.schema_version,
                entry.artifact_kind.as_str(),
                entry.stored_at,
                payload
            ],
        );
        if let Err(err) = result {
            log(
                Level::Warn,
                Domain::Cache,
                "durable_write_failed",
                obj(&[("key", v_str(key)), ("error", v_str(&err.to_string()))]),
            );
        }
    }

    /// Delete entries for a URL. Without a kind, all artifact-kind variants
    /// are removed so a stale lite artifact cannot shadow a later full one.
    pub fn delete(&self, url: &str, kind: Option<ArtifactKind>) {
        match kind {
            Some(kind) => {
                let key = self.key(url, kind);
                if let Ok(mut memory) = self.memory.lock() {
                    memory.remove(&key);
                }
                if let Some(durable) = self.durable.as_ref() {
                    if let Ok(conn) = durable.lock() {
                        let _ = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]);
                    }
                }
            }
            None => {
                let prefix = self.key_prefix(url);
                if let Ok(mut memory) = self.memory.lock() {
                    memory.retain(|k, _| !k.starts_with(&prefix));
                }
                if let Some(durable) = self.durable.as_ref() {
                    if let Ok(conn) = durable.lock() {
                        let pattern = format!("{}%", prefix.replace('%', "\\%"));
                        let _ = conn.execute(
                            "DELETE FROM cache_entries WHERE key LIKE ?1 ESCAPE '\\'",
                            params![pattern],
                        );
                    }
                }
            }
        }
    }

    /// Drop the fast tier only. Used by tests to simulate a cold start.
    pub fn clear_memory(&self) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.clear();
        }
    }
}

/// Percent-encode a URL for use inside a cache key. Unreserved characters
/// pass through; everything else (including `:` and `%`) is escaped so the
/// `::` kind separator stays unambiguous.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
