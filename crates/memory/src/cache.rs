//! Content-addressed response cache backed by [`redb`].
//!
//! Keys are the SHA-256 hex digest of the lower-cased, trimmed
//! `system|||user` pair, so two turns that would send the model an identical
//! payload resolve to the same entry.  Entries never expire; `hearth cache
//! clear` is the only way to drop them.
//!
//! # Tables
//!
//! | Name        | Key              | Value                    |
//! |-------------|------------------|--------------------------|
//! | `responses` | hex digest (64c) | JSON [`CacheEntry`]      |
//!
//! A small LRU in front of redb serves repeated lookups without a read
//! transaction and keeps hit/miss counters for `hearth memory stats`.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::schema::truncate_str;

const RESPONSES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("responses");

const HOT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: String,
    /// First characters of the user content, for inspection only.
    pub query_preview: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit rate as a percentage 0.0 – 100.0.
    pub hit_rate_pct: f32,
}

struct HotLayer {
    lru: LruCache<String, String>,
    hits: u64,
    misses: u64,
}

pub struct ResponseCache {
    db: Option<Database>,
    path: PathBuf,
    hot: Mutex<HotLayer>,
}

pub fn cache_key(system: &str, user: &str) -> String {
    let normalized = format!("{system}|||{user}").trim().to_lowercase();
    let mut h = Sha256::new();
    h.update(normalized.as_bytes());
    format!("{:x}", h.finalize())
}

impl ResponseCache {
    /// Open or create the cache file.  With `enabled = false` no file is
    /// touched: lookups always miss and stores are dropped.
    pub fn open(path: impl AsRef<Path>, enabled: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = if enabled {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let db = Database::create(&path)
                .with_context(|| format!("opening response cache at {}", path.display()))?;
            {
                let tx = db.begin_write()?;
                tx.open_table(RESPONSES_TABLE)?;
                tx.commit()?;
            }
            Some(db)
        } else {
            None
        };

        Ok(Self {
            db,
            path,
            hot: Mutex::new(HotLayer {
                lru: LruCache::new(NonZeroUsize::new(HOT_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
                hits: 0,
                misses: 0,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, system: &str, user: &str) -> Result<Option<String>> {
        let Some(db) = &self.db else {
            return Ok(None);
        };
        let key = cache_key(system, user);

        let hot_hit = self.hot.lock().lru.get(&key).cloned();
        if let Some(response) = hot_hit {
            self.record(true);
            return Ok(Some(response));
        }

        let tx = db.begin_read()?;
        let tbl = tx.open_table(RESPONSES_TABLE)?;
        let found = match tbl.get(key.as_str())? {
            Some(v) => Some(serde_json::from_slice::<CacheEntry>(v.value())?.response),
            None => None,
        };

        match &found {
            Some(response) => {
                self.hot.lock().lru.put(key, response.clone());
                self.record(true);
            }
            None => self.record(false),
        }
        Ok(found)
    }

    pub fn store(&self, system: &str, user: &str, response: &str) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let key = cache_key(system, user);
        let entry = CacheEntry {
            key: key.clone(),
            response: response.to_string(),
            query_preview: truncate_str(user.trim(), 50).to_string(),
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let tx = db.begin_write()?;
        {
            let mut tbl = tx.open_table(RESPONSES_TABLE)?;
            tbl.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;

        debug!(key = %&key[..12], "response cached");
        self.hot.lock().lru.put(key, entry.response);
        Ok(())
    }

    /// Remove every entry.  Returns how many were dropped.
    pub fn clear(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let tx = db.begin_write()?;
        let removed = {
            let mut tbl = tx.open_table(RESPONSES_TABLE)?;
            let keys: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                .collect();
            for k in &keys {
                tbl.remove(k.as_str())?;
            }
            keys.len()
        };
        tx.commit()?;
        self.hot.lock().lru.clear();
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let tx = db.begin_read()?;
        let tbl = tx.open_table(RESPONSES_TABLE)?;
        Ok(tbl.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let entries = self.len()?;
        let hot = self.hot.lock();
        let total = hot.hits + hot.misses;
        Ok(CacheStats {
            entries,
            hits: hot.hits,
            misses: hot.misses,
            hit_rate_pct: if total == 0 {
                0.0
            } else {
                (hot.hits as f32 / total as f32) * 100.0
            },
        })
    }

    fn record(&self, hit: bool) {
        let mut hot = self.hot.lock();
        if hit {
            hot.hits += 1;
        } else {
            hot.misses += 1;
        }
    }
}
