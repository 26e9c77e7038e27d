//! Vector memory index: brute-force inner product over unit-normalized
//! embeddings of lore chunks and episodes.
//!
//! # On-disk layout
//!
//! | File                 | Contents                                                   |
//! |----------------------|------------------------------------------------------------|
//! | `vector.index`       | `HVEC` magic, u32 LE dimension, u32 LE count, f32 LE data  |
//! | `vector_chunks.json` | JSON array of [`Chunk`] in insertion order                 |
//!
//! Both files are written to a `.tmp` sibling and renamed into place.  If
//! they are missing, unreadable, or disagree with each other the index
//! starts empty and the caller may rebuild it from sources.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::embedding::{Embedder, EmbeddingError, dot, l2_normalize};
use crate::schema::{Chunk, Episode, SearchHit};

const MAGIC: &[u8; 4] = b"HVEC";
const HEADER_LEN: usize = 12;

#[derive(Debug, Default)]
struct IndexState {
    chunks: Vec<Chunk>,
    /// Row-major, `chunks.len() * dimension` floats.
    vectors: Vec<f32>,
}

impl IndexState {
    fn len(&self) -> usize {
        self.chunks.len()
    }
}

pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    dimension: usize,
    index_path: PathBuf,
    chunks_path: PathBuf,
    state: Mutex<IndexState>,
}

impl VectorIndex {
    /// Open the index files, starting empty when they are absent or invalid.
    pub fn open(
        embedder: Arc<dyn Embedder>,
        index_path: impl Into<PathBuf>,
        chunks_path: impl Into<PathBuf>,
    ) -> Self {
        let dimension = embedder.dimension();
        let index_path = index_path.into();
        let chunks_path = chunks_path.into();

        let state = match load_state(&index_path, &chunks_path, dimension) {
            Ok(Some(state)) => {
                info!(chunks = state.len(), "vector index loaded");
                state
            }
            Ok(None) => IndexState::default(),
            Err(err) => {
                warn!(error = %err, path = %index_path.display(), "vector index unreadable, starting empty");
                IndexState::default()
            }
        };

        Self {
            embedder,
            dimension,
            index_path,
            chunks_path,
            state: Mutex::new(state),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.state.lock().chunks.clone()
    }

    /// Size of the vector file in bytes, 0 when it does not exist.
    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.index_path).map(|m| m.len()).unwrap_or(0)
    }

    /// Replace the whole index with fresh embeddings of `lore` plus every
    /// episode.  An unavailable embedder leaves an empty, persisted index.
    pub async fn build_index(&self, lore: Vec<Chunk>, episodes: &[Episode]) -> Result<usize> {
        let sources = lore
            .into_iter()
            .chain(episodes.iter().map(|e| Chunk::new(e.chunk_source(), e.content.clone())))
            .filter(|c| !c.text.trim().is_empty() && !c.source.is_empty());

        let mut fresh = IndexState::default();
        for chunk in sources {
            match self.embed_normalized(&chunk.text).await {
                Ok(vector) => {
                    fresh.vectors.extend_from_slice(&vector);
                    fresh.chunks.push(chunk);
                }
                Err(err) if err.is_unavailable() => {
                    warn!(error = %err, "embedder unavailable, vector index left empty");
                    fresh = IndexState::default();
                    break;
                }
                Err(err) => {
                    warn!(error = %err, source = %chunk.source, "skipping chunk that failed to embed");
                }
            }
        }

        let count = fresh.len();
        save_state(&self.index_path, &self.chunks_path, self.dimension, &fresh)?;
        *self.state.lock() = fresh;
        info!(chunks = count, "vector index built");
        Ok(count)
    }

    /// Embed and append one chunk, persisting the result.  Returns `false`
    /// without touching the index when the text or source is empty, the
    /// embedder is unavailable, or the write fails.
    pub async fn add_chunk(&self, text: &str, source: &str) -> bool {
        if text.trim().is_empty() || source.trim().is_empty() {
            return false;
        }

        let vector = match self.embed_normalized(text).await {
            Ok(vector) => vector,
            Err(err) => {
                debug!(error = %err, source, "chunk not indexed");
                return false;
            }
        };

        let mut state = self.state.lock();
        state.chunks.push(Chunk::new(source, text));
        state.vectors.extend_from_slice(&vector);
        if let Err(err) = save_state(&self.index_path, &self.chunks_path, self.dimension, &state) {
            warn!(error = %err, "persisting vector index failed, rolling back chunk");
            state.chunks.pop();
            let keep = state.chunks.len() * self.dimension;
            state.vectors.truncate(keep);
            return false;
        }
        debug!(source, total = state.len(), "chunk indexed");
        true
    }

    /// Top-`k` chunks by cosine similarity, best first.  Ties keep insertion
    /// order.  Empty queries, an empty index, or an unavailable embedder all
    /// yield no hits.
    pub async fn search(&self, query: &str, k: usize) -> Vec<SearchHit> {
        if query.trim().is_empty() || k == 0 || self.dimension == 0 || self.is_empty() {
            return Vec::new();
        }

        let query_vec = match self.embed_normalized(query).await {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "vector search skipped");
                return Vec::new();
            }
        };

        let state = self.state.lock();
        let mut scored: Vec<(usize, f32)> = state
            .vectors
            .chunks_exact(self.dimension)
            .map(|row| dot(row, &query_vec))
            .enumerate()
            .collect();
        // `sort_by` is stable, so equal scores stay in insertion order.
        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));

        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| SearchHit {
                source: state.chunks[i].source.clone(),
                text: state.chunks[i].text.clone(),
                score,
            })
            .collect()
    }

    /// Drop the first chunk whose text matches exactly.
    pub fn remove_text(&self, text: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(pos) = state.chunks.iter().position(|c| c.text == text) else {
            return Ok(false);
        };
        state.chunks.remove(pos);
        let start = pos * self.dimension;
        state.vectors.drain(start..start + self.dimension);
        save_state(&self.index_path, &self.chunks_path, self.dimension, &state)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        *state = IndexState::default();
        save_state(&self.index_path, &self.chunks_path, self.dimension, &state)
    }

    async fn embed_normalized(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = self.embedder.embed(text).await?;
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

// ── persistence ───────────────────────────────────────────────────────────────

fn load_state(index_path: &Path, chunks_path: &Path, dimension: usize) -> Result<Option<IndexState>> {
    if !index_path.exists() && !chunks_path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(index_path)
        .with_context(|| format!("reading {}", index_path.display()))?;
    let (file_dim, vectors) = decode_vectors(&bytes)?;
    if file_dim != dimension {
        bail!("index dimension {file_dim} does not match embedder dimension {dimension}");
    }

    let raw = fs::read_to_string(chunks_path)
        .with_context(|| format!("reading {}", chunks_path.display()))?;
    let chunks: Vec<Chunk> = serde_json::from_str(&raw)?;
    if chunks.len() * dimension != vectors.len() {
        bail!(
            "chunk metadata has {} entries but index holds {} vectors",
            chunks.len(),
            vectors.len() / dimension.max(1)
        );
    }

    Ok(Some(IndexState { chunks, vectors }))
}

fn save_state(index_path: &Path, chunks_path: &Path, dimension: usize, state: &IndexState) -> Result<()> {
    write_atomic(index_path, &encode_vectors(dimension, state.len(), &state.vectors))?;
    write_atomic(chunks_path, serde_json::to_string(&state.chunks)?.as_bytes())?;
    Ok(())
}

fn encode_vectors(dimension: usize, count: usize, vectors: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + vectors.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(dimension as u32).to_le_bytes());
    out.extend_from_slice(&(count as u32).to_le_bytes());
    for v in vectors {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_vectors(bytes: &[u8]) -> Result<(usize, Vec<f32>)> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        bail!("not a vector index file");
    }
    let dimension = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != dimension * count * 4 {
        bail!("vector index truncated: expected {} bytes, found {}", dimension * count * 4, body.len());
    }
    let vectors = body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((dimension, vectors))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "vector".to_string());
    let tmp_path = path.with_file_name(format!("{filename}.tmp"));
    if let Err(err) = fs::write(&tmp_path, bytes) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    /// Deterministic bag-of-letters embedder: each of the first `dim`
    /// lowercase letters counts into its own axis.
    pub(crate) struct LetterEmbedder {
        pub dim: usize,
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let mut v = vec![0.0; self.dim];
            for c in text.chars().filter(char::is_ascii_lowercase) {
                let axis = (c as u8 - b'a') as usize;
                if axis < self.dim {
                    v[axis] += 1.0;
                }
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    fn open_in(dir: &TempDir, embedder: Arc<dyn Embedder>) -> VectorIndex {
        VectorIndex::open(
            embedder,
            dir.path().join("vector.index"),
            dir.path().join("vector_chunks.json"),
        )
    }

    fn letters() -> Arc<dyn Embedder> {
        Arc::new(LetterEmbedder { dim: 26 })
    }

    fn episode(id: i64, content: &str) -> Episode {
        Episode {
            id,
            content: content.to_string(),
            source: format!("summarizer_cycle_{id:03}"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unavailable_embedder_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let index = open_in(&dir, Arc::new(DisabledEmbedder { dimension: 768 }));

        let built = index
            .build_index(vec![Chunk::new("lore/self", "loves the sea")], &[episode(1, "x")])
            .await
            .unwrap();
        assert_eq!(built, 0);
        assert!(index.search("sea", 5).await.is_empty());
        assert!(!index.add_chunk("new fact", "episode/x").await);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn build_index_covers_lore_and_episodes() {
        let dir = TempDir::new().unwrap();
        let index = open_in(&dir, letters());
        let lore = vec![Chunk::new("lore/self", "aaaa"), Chunk::new("lore/user", "bbbb")];
        let built = index.build_index(lore, &[episode(7, "cccc")]).await.unwrap();
        assert_eq!(built, 3);

        let sources: Vec<String> = index.chunks().into_iter().map(|c| c.source).collect();
        assert_eq!(sources, vec!["lore/self", "lore/user", "episode/summarizer_cycle_007"]);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_and_truncates() {
        let dir = TempDir::new().unwrap();
        let index = open_in(&dir, letters());
        assert!(index.add_chunk("aaaa", "lore/a").await);
        assert!(index.add_chunk("bbbb", "lore/b").await);
        assert!(index.add_chunk("aabb", "lore/ab").await);

        let hits = index.search("aaa", 2).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, "lore/a");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].source, "lore/ab");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let dir = TempDir::new().unwrap();
        let index = open_in(&dir, letters());
        index.add_chunk("ab", "first").await;
        index.add_chunk("ba", "second").await;
        index.add_chunk("ab", "third").await;

        let hits = index.search("ab", 3).await;
        let order: Vec<&str> = hits.iter().map(|h| h.source.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected() {
        let dir = TempDir::new().unwrap();
        let index = open_in(&dir, letters());
        assert!(!index.add_chunk("  ", "lore/a").await);
        assert!(!index.add_chunk("text", "").await);
        index.add_chunk("text", "lore/a").await;
        assert!(index.search("   ", 3).await.is_empty());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let index = open_in(&dir, letters());
            index.add_chunk("hello there", "episode/one").await;
            index.add_chunk("general kenobi", "episode/two").await;
        }
        let reopened = open_in(&dir, letters());
        assert_eq!(reopened.len(), 2);
        let hits = reopened.search("hello there", 1).await;
        assert_eq!(hits[0].source, "episode/one");
        assert!(reopened.file_size() > HEADER_LEN as u64);
    }

    #[tokio::test]
    async fn dimension_mismatch_on_disk_starts_empty() {
        let dir = TempDir::new().unwrap();
        {
            let index = open_in(&dir, letters());
            index.add_chunk("hello", "episode/one").await;
        }
        let narrower = open_in(&dir, Arc::new(LetterEmbedder { dim: 8 }));
        assert!(narrower.is_empty());
    }

    #[tokio::test]
    async fn corrupt_files_start_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("vector.index"), b"garbage").unwrap();
        fs::write(dir.path().join("vector_chunks.json"), b"[").unwrap();
        let index = open_in(&dir, letters());
        assert!(index.is_empty());
        assert!(index.add_chunk("recovers", "episode/x").await);
    }

    #[tokio::test]
    async fn remove_text_keeps_vectors_aligned() {
        let dir = TempDir::new().unwrap();
        let index = open_in(&dir, letters());
        index.add_chunk("aaaa", "one").await;
        index.add_chunk("bbbb", "two").await;
        assert!(index.remove_text("aaaa").unwrap());
        assert!(!index.remove_text("aaaa").unwrap());

        let hits = index.search("bbbb", 1).await;
        assert_eq!(hits[0].source, "two");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let mut bytes = encode_vectors(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        bytes.truncate(bytes.len() - 1);
        assert!(decode_vectors(&bytes).is_err());
    }
}
