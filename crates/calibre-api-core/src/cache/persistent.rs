//! SQLite durable tier of the query cache
//!
//! Survives restarts so a freshly started service does not recompute every
//! statistics snapshot. WAL journal, one writer connection and a small pool
//! of reader connections.
//!
//! Schema:
//! - cache_metadata: schema version (table cleared on mismatch)
//! - cache_entries: fingerprint → payload, timestamps in ms since epoch,
//!   source stamp and an access counter used for LRU eviction
//!
//! Cache Version History:
//! - v1: Initial version
//! - v2: Lower-case percent escapes in fingerprints

use super::{CacheEntry, Fingerprint, FingerprintPattern};
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bump whenever the stored payload layout changes
const CACHE_VERSION: i32 = 2;

/// Database file inside the cache directory
pub const CACHE_DB: &str = "query-cache.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending LRU touches that trigger an opportunistic write
const TOUCH_BATCH: usize = 256;

/// Storage backend for cache entries
///
/// Blocking; the cache layer calls it from the blocking thread pool. A
/// failure here is never fatal to a query.
pub trait DurableStore: Send + Sync {
    /// The stored entry, expired or not
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace
    fn store(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Returns whether an entry was removed
    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;

    fn remove_matching(&self, pattern: &FingerprintPattern) -> Result<usize, CacheError>;

    fn clear(&self) -> Result<usize, CacheError>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError>;

    fn stats(&self) -> Result<StoreStats, CacheError>;

    /// Make everything written so far durable
    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Durable tier statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_size_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// LRU bound, `None` for unbounded
    pub max_entries: Option<usize>,
    pub reader_connections: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_entries: Some(100),
            reader_connections: 4,
        }
    }
}

/// SQLite-backed [`DurableStore`]
pub struct SqliteStore {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    /// Monotonic access counter; higher means more recently used
    access_clock: AtomicI64,
    /// Reads recorded since the last write, fingerprint → access tick.
    /// Lock after `writer`, never before.
    pending_touches: Mutex<HashMap<String, i64>>,
    max_entries: Option<usize>,
    path: PathBuf,
}

impl SqliteStore {
    /// Create or open the cache database in `cache_dir`
    pub fn open(cache_dir: &Path, options: StoreOptions) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_dir).map_err(|source| CacheError::CreateDir {
            path: cache_dir.to_path_buf(),
            source,
        })?;

        let path = cache_dir.join(CACHE_DB);
        let writer = Connection::open(&path).map_err(CacheError::db("open cache database"))?;
        writer
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(CacheError::db("set busy timeout"))?;
        writer
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(CacheError::db("enable WAL mode"))?;
        writer
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(CacheError::db("set synchronous mode"))?;

        writer
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS cache_metadata (
                    key TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cache_entries (
                    fingerprint TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    source_stamp INTEGER,
                    last_accessed INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_expires_at ON cache_entries(expires_at);
                CREATE INDEX IF NOT EXISTS idx_last_accessed ON cache_entries(last_accessed);
                "#,
            )
            .map_err(CacheError::db("create schema"))?;

        Self::check_version(&writer)?;

        let clock: i64 = writer
            .query_row(
                "SELECT COALESCE(MAX(last_accessed), 0) FROM cache_entries",
                [],
                |row| row.get(0),
            )
            .map_err(CacheError::db("read access clock"))?;

        let mut readers = Vec::with_capacity(options.reader_connections.max(1));
        for _ in 0..options.reader_connections.max(1) {
            let reader = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(CacheError::db("open reader connection"))?;
            reader
                .busy_timeout(BUSY_TIMEOUT)
                .map_err(CacheError::db("set busy timeout"))?;
            readers.push(Mutex::new(reader));
        }

        let store = Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            access_clock: AtomicI64::new(clock),
            pending_touches: Mutex::new(HashMap::new()),
            max_entries: options.max_entries,
            path,
        };

        let purged = store.purge_expired(Utc::now())?;
        info!(
            path = %store.path.display(),
            purged,
            max_entries = ?store.max_entries,
            "Query cache database opened"
        );

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clear the table when it was written by a different schema version
    fn check_version(conn: &Connection) -> Result<(), CacheError> {
        let stored_version: Option<i32> = conn
            .query_row(
                "SELECT value FROM cache_metadata WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(CacheError::db("query cache version"))?;

        match stored_version {
            Some(v) if v == CACHE_VERSION => {
                debug!("Cache version {} matches current", CACHE_VERSION);
                return Ok(());
            }
            Some(v) => {
                warn!(
                    stored = v,
                    current = CACHE_VERSION,
                    "Cache version mismatch detected, clearing stale cache"
                );
                conn.execute("DELETE FROM cache_entries", [])
                    .map_err(CacheError::db("clear stale cache"))?;
            }
            None => debug!("Cache version initialized to {}", CACHE_VERSION),
        }

        conn.execute(
            "INSERT OR REPLACE INTO cache_metadata (key, value) VALUES ('version', ?)",
            params![CACHE_VERSION],
        )
        .map_err(CacheError::db("update cache version"))?;
        Ok(())
    }

    fn tick(&self) -> i64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a read for LRU ordering without touching the writer
    fn record_touch(&self, fingerprint: &Fingerprint) {
        let pending = {
            let mut touches = self.pending_touches.lock();
            touches.insert(fingerprint.as_str().to_string(), self.tick());
            touches.len()
        };

        if pending < TOUCH_BATCH {
            return;
        }
        // A busy writer picks the batch up on its next store
        if let Some(conn) = self.writer.try_lock() {
            if let Err(e) = self.apply_touches(&conn) {
                warn!("Failed to record cache entry access: {}", e);
            }
        }
    }

    /// Write pending touches; the caller holds the writer lock
    fn apply_touches(&self, conn: &Connection) -> Result<usize, CacheError> {
        let touches = std::mem::take(&mut *self.pending_touches.lock());
        if touches.is_empty() {
            return Ok(0);
        }

        let mut stmt = conn
            .prepare_cached(
                "UPDATE cache_entries SET last_accessed = MAX(last_accessed, ?) WHERE fingerprint = ?",
            )
            .map_err(CacheError::db("prepare touch"))?;
        for (fingerprint, tick) in &touches {
            stmt.execute(params![tick, fingerprint])
                .map_err(CacheError::db("touch entry"))?;
        }
        debug!(touched = touches.len(), "Recorded cache entry accesses");
        Ok(touches.len())
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[index].lock();
        f(&conn)
    }

    fn read_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
        Ok(CacheEntry {
            fingerprint: Fingerprint::from_raw(row.get::<_, String>("fingerprint")?),
            payload: row.get("payload")?,
            created_at: from_millis(row.get("created_at")?),
            expires_at: from_millis(row.get("expires_at")?),
            source_stamp: row.get("source_stamp")?,
        })
    }
}

impl DurableStore for SqliteStore {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let entry = self.with_reader(|conn| {
            conn.query_row(
                "SELECT fingerprint, payload, created_at, expires_at, source_stamp
                 FROM cache_entries WHERE fingerprint = ?",
                params![fingerprint.as_str()],
                Self::read_entry,
            )
            .optional()
            .map_err(CacheError::db("load entry"))
        })?;

        if entry.is_some() && self.max_entries.is_some() {
            self.record_touch(fingerprint);
        }

        debug!(fingerprint = %fingerprint, hit = entry.is_some(), "Durable cache lookup");
        Ok(entry)
    }

    fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(CacheError::db("begin transaction"))?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO cache_entries
            (fingerprint, payload, created_at, expires_at, source_stamp, last_accessed)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                entry.fingerprint.as_str(),
                &entry.payload,
                entry.created_at.timestamp_millis(),
                entry.expires_at.timestamp_millis(),
                entry.source_stamp,
                self.tick(),
            ],
        )
        .map_err(CacheError::db("insert entry"))?;

        let mut evicted = 0;
        if let Some(max) = self.max_entries {
            if let Err(e) = self.apply_touches(&tx) {
                warn!("Failed to record cache entry access: {}", e);
            }
            let count: i64 = tx
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
                .map_err(CacheError::db("count entries"))?;
            let excess = count - max as i64;

            if excess > 0 {
                evicted = tx
                    .execute(
                        r#"
                        DELETE FROM cache_entries WHERE fingerprint IN (
                            SELECT fingerprint FROM cache_entries
                            WHERE fingerprint != ?1
                            ORDER BY last_accessed ASC
                            LIMIT ?2
                        )
                        "#,
                        params![entry.fingerprint.as_str(), excess],
                    )
                    .map_err(CacheError::db("evict entries"))?;
            }
        }

        tx.commit().map_err(CacheError::db("commit entry"))?;

        if evicted > 0 {
            debug!(evicted, "Evicted least recently used cache entries");
        }
        debug!(fingerprint = %entry.fingerprint, "Entry persisted");
        Ok(())
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let conn = self.writer.lock();
        let removed = conn
            .execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?",
                params![fingerprint.as_str()],
            )
            .map_err(CacheError::db("delete entry"))?;
        Ok(removed > 0)
    }

    fn remove_matching(&self, pattern: &FingerprintPattern) -> Result<usize, CacheError> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction()
            .map_err(CacheError::db("begin transaction"))?;

        let matching: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT fingerprint FROM cache_entries")
                .map_err(CacheError::db("prepare fingerprint listing"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(CacheError::db("list fingerprints"))?;

            let mut matching = Vec::new();
            for row in rows {
                let raw = row.map_err(CacheError::db("read fingerprint"))?;
                if pattern.matches(&Fingerprint::from_raw(raw.as_str())) {
                    matching.push(raw);
                }
            }
            matching
        };

        for fingerprint in &matching {
            tx.execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?",
                params![fingerprint],
            )
            .map_err(CacheError::db("delete matching entry"))?;
        }
        tx.commit().map_err(CacheError::db("commit invalidation"))?;

        debug!(pattern = pattern.as_str(), removed = matching.len(), "Entries invalidated");
        Ok(matching.len())
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let conn = self.writer.lock();
        let removed = conn
            .execute("DELETE FROM cache_entries", [])
            .map_err(CacheError::db("clear cache"))?;
        debug!(removed, "Cache cleared");
        Ok(removed)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let conn = self.writer.lock();
        conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?",
            params![now.timestamp_millis()],
        )
        .map_err(CacheError::db("purge expired entries"))
    }

    fn stats(&self) -> Result<StoreStats, CacheError> {
        let now = Utc::now().timestamp_millis();
        self.with_reader(|conn| {
            conn.query_row(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(LENGTH(payload)), 0)
                FROM cache_entries
                "#,
                params![now],
                |row| {
                    Ok(StoreStats {
                        total_entries: row.get::<_, i64>(0)? as usize,
                        expired_entries: row.get::<_, i64>(1)? as usize,
                        total_size_bytes: row.get::<_, i64>(2)? as usize,
                    })
                },
            )
            .map_err(CacheError::db("collect statistics"))
        })
    }

    fn flush(&self) -> Result<(), CacheError> {
        let conn = self.writer.lock();
        self.apply_touches(&conn)?;
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")
            .map_err(CacheError::db("checkpoint WAL"))?;
        conn.execute_batch("PRAGMA optimize;")
            .map_err(CacheError::db("optimize"))
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        // Keep the WAL from growing unbounded across restarts
        let conn = self.writer.lock();
        if let Err(e) = self.apply_touches(&conn) {
            warn!("Failed to record cache entry access on cache drop: {}", e);
        }
        if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
            warn!("Failed to checkpoint WAL on cache drop: {}", e);
        } else {
            debug!("WAL checkpoint completed on cache drop");
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
