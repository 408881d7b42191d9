//! Persistent fetch cache.
//!
//! SQLite-backed mirror of successful fetch responses, keyed by request id.
//! The cache is a convenience channel only: live responses always travel
//! through the shared-memory bridge, and a cache write failure never fails
//! the fetch that produced it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Compute SHA-256 hash of a response body for integrity checks
pub fn compute_content_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// A cached fetch response
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFetch {
    pub id: String,
    pub url: String,
    pub body: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

pub struct FetchCache {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl FetchCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open fetch cache at {:?}", path))?;

        // WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to enable WAL mode")?;

        // Avoid "database is locked" errors under contention
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("Failed to set busy_timeout")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fetch_cache (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                body BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .context("Failed to create fetch_cache table")?;

        // Migration: add url column for caches created before it existed
        let has_url_column: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('fetch_cache') WHERE name='url'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !has_url_column {
            conn.execute(
                "ALTER TABLE fetch_cache ADD COLUMN url TEXT NOT NULL DEFAULT ''",
                [],
            )
            .context("Failed to add url column")?;
            info!("Migrated fetch cache: added url column");
        }

        debug!(path = %path.display(), "Fetch cache opened");
        Ok(FetchCache {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store a response body under the fetch id, replacing any prior entry.
    pub fn put(&self, id: &str, url: &str, body: &[u8]) -> Result<()> {
        let hash = compute_content_hash(body);
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute(
            "INSERT OR REPLACE INTO fetch_cache (id, url, body, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, url, body, hash, now],
        )
        .context("Failed to write fetch cache entry")?;
        Ok(())
    }

    /// Look up a cached response. Entries whose stored hash no longer matches
    /// the body are treated as absent and removed.
    pub fn get(&self, id: &str) -> Result<Option<CachedFetch>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let row = conn
            .query_row(
                "SELECT id, url, body, content_hash, created_at FROM fetch_cache WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        CachedFetch {
                            id: row.get(0)?,
                            url: row.get(1)?,
                            body: row.get(2)?,
                            created_at: row.get(4)?,
                        },
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to read fetch cache entry")?;

        match row {
            None => Ok(None),
            Some((entry, stored_hash)) => {
                if compute_content_hash(&entry.body) == stored_hash {
                    Ok(Some(entry))
                } else {
                    debug!(%id, "Fetch cache entry failed hash check, evicting");
                    conn.execute("DELETE FROM fetch_cache WHERE id = ?1", params![id])
                        .context("Failed to evict corrupt cache entry")?;
                    Ok(None)
                }
            }
        }
    }

    /// Delete entries older than `max_age_ms`, returning how many went.
    pub fn prune(&self, max_age_ms: i64) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - max_age_ms;
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let removed = conn
            .execute(
                "DELETE FROM fetch_cache WHERE created_at < ?1",
                params![cutoff],
            )
            .context("Failed to prune fetch cache")?;
        if removed > 0 {
            info!(removed, "Pruned fetch cache");
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fetch_cache", [], |row| row.get(0))
            .context("Failed to count fetch cache entries")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("fetch cache mutex poisoned")
}
