//! Keyword memory index: SQLite FTS5 over persisted [`Episode`]s.
//!
//! # Tables
//!
//! | Name           | Kind                          | Purpose                          |
//! |----------------|-------------------------------|----------------------------------|
//! | `episodes`     | regular, `AUTOINCREMENT` id   | canonical episode rows           |
//! | `episodes_fts` | FTS5, external content        | full-text index over `content`   |
//!
//! Triggers keep the FTS table in step with inserts and deletes.  The
//! `AUTOINCREMENT` key guarantees an id is never handed out twice, even
//! after deletes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::schema::{Episode, KeywordSearch, truncate_str};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE VIRTUAL TABLE IF NOT EXISTS episodes_fts USING fts5(
    content,
    content='episodes',
    content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS episodes_ai AFTER INSERT ON episodes BEGIN
    INSERT INTO episodes_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS episodes_ad AFTER DELETE ON episodes BEGIN
    INSERT INTO episodes_fts(episodes_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;
";

/// Function words dropped from natural-language queries before matching.
/// `remember` is included because it is the usual recall cue and matches
/// nothing useful on its own.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "when", "at", "by", "for", "from",
    "in", "into", "of", "off", "on", "onto", "to", "with", "is", "are", "was", "were", "be",
    "been", "being", "have", "has", "had", "do", "does", "did", "can", "could", "will", "would",
    "should", "may", "might", "must", "i", "you", "he", "she", "it", "we", "they", "my", "your",
    "his", "her", "its", "our", "their", "me", "him", "us", "them", "what", "which", "who",
    "whom", "this", "that", "these", "those", "am", "remember",
];

/// Separator between episodes in an ingestable `.txt` file.
pub const EPISODE_DELIMITER: &str = "---";

pub struct KeywordIndex {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl KeywordIndex {
    /// Open or create the episode database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("opening episode database at {}", path.display()))?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("creating episode schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add_episode(&self, content: &str, source: &str) -> Result<Episode> {
        let created_at = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO episodes (content, source, created_at) VALUES (?1, ?2, ?3)",
            params![content, source, created_at],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, source, chars = content.len(), "episode added");
        Ok(Episode {
            id,
            content: content.to_string(),
            source: source.to_string(),
            created_at,
        })
    }

    /// Rank episodes against a natural-language query.
    ///
    /// Tokens are quoted and OR-ed together so "do you remember college"
    /// still matches an episode that only mentions college.
    pub fn search(&self, query: &str, limit: usize) -> KeywordSearch {
        let Some(fts_query) = build_match_query(query) else {
            return KeywordSearch::Empty;
        };

        let conn = self.conn.lock();
        let result = (|| -> rusqlite::Result<Vec<Episode>> {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.content, e.source, e.created_at
                 FROM episodes e
                 JOIN (SELECT rowid, rank FROM episodes_fts
                       WHERE episodes_fts MATCH ?1
                       ORDER BY rank LIMIT ?2) m ON e.id = m.rowid
                 ORDER BY m.rank",
            )?;
            let rows = stmt.query_map(params![fts_query, limit as i64], episode_from_row)?;
            rows.collect()
        })();

        match result {
            Ok(hits) => {
                debug!(query = %truncate_str(query, 50), hits = hits.len(), "keyword search");
                KeywordSearch::Hits(hits)
            }
            Err(err) => {
                debug!(query = %truncate_str(query, 50), error = %err, "keyword query rejected");
                KeywordSearch::QueryError(err.to_string())
            }
        }
    }

    pub fn get(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn.lock();
        let episode = conn
            .query_row(
                "SELECT id, content, source, created_at FROM episodes WHERE id = ?1",
                params![id],
                episode_from_row,
            )
            .optional()?;
        Ok(episode)
    }

    /// Every episode, oldest first.
    pub fn list(&self) -> Result<Vec<Episode>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, content, source, created_at FROM episodes ORDER BY id")?;
        let rows = stmt.query_map([], episode_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove one episode, returning it if it existed.
    pub fn delete(&self, id: i64) -> Result<Option<Episode>> {
        let Some(episode) = self.get(id)? else {
            return Ok(None);
        };
        let conn = self.conn.lock();
        conn.execute("DELETE FROM episodes WHERE id = ?1", params![id])?;
        info!(id, source = %episode.source, "episode deleted");
        Ok(Some(episode))
    }

    /// Delete every episode.  Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM episodes", [])?;
        warn!(removed, "all episodes deleted");
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn counts_by_source(&self) -> Result<BTreeMap<String, usize>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT source, COUNT(*) FROM episodes GROUP BY source")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }

    /// Ingest a text file of `---`-separated episodes.  The file name becomes
    /// the source tag.  A missing file ingests nothing.
    pub fn ingest_text_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading episode file {}", path.display()))?;
        let source = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "ingested".to_string());

        let mut added = 0;
        for piece in raw.split(EPISODE_DELIMITER) {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            self.add_episode(piece, &source)?;
            added += 1;
        }
        info!(file = %path.display(), added, "episodes ingested");
        Ok(added)
    }
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        content: row.get(1)?,
        source: row.get(2)?,
        created_at: row.get::<_, DateTime<Utc>>(3)?,
    })
}

/// Turn free text into an FTS5 `MATCH` expression, or `None` when nothing
/// searchable remains.
pub fn build_match_query(query: &str) -> Option<String> {
    let sanitized = query.replace(['"', '\''], "");
    let raw_tokens: Vec<&str> = sanitized.split_whitespace().collect();
    if raw_tokens.is_empty() {
        return None;
    }

    let filtered: Vec<&str> = raw_tokens
        .iter()
        .copied()
        .filter(|token| !STOP_WORDS.contains(&token.to_lowercase().as_str()))
        .collect();
    // A query made only of stop words ("do you remember") still searches
    // with its original words rather than returning nothing.
    let tokens = if filtered.is_empty() { raw_tokens } else { filtered };

    Some(
        tokens
            .iter()
            .map(|token| format!("\"{token}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}
