use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use hearth_config::AppConfig;

use crate::cache::{CacheStats, ResponseCache};
use crate::embedding::Embedder;
use crate::keyword::KeywordIndex;
use crate::lore::collect_lore;
use crate::schema::Episode;
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub episodes: usize,
    pub episodes_by_source: BTreeMap<String, usize>,
    pub chunks: usize,
    pub lore_chunks: usize,
    pub vector_file_bytes: u64,
    pub cache: CacheStats,
}

/// Owns both memory indices and the response cache, and implements the
/// management operations that keep them aligned.
pub struct MemoryManager {
    keyword: KeywordIndex,
    vector: VectorIndex,
    cache: ResponseCache,
    lore_sources: Vec<(String, PathBuf)>,
}

impl MemoryManager {
    /// Open every store under the configured data directory.  Failing to
    /// open durable storage here is the only fatal memory error.
    pub fn open(config: &AppConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        fs::create_dir_all(config.data_dir())
            .with_context(|| format!("creating data dir {}", config.data_dir().display()))?;
        let keyword = KeywordIndex::open(config.episodes_db_path())?;
        let vector = VectorIndex::open(
            embedder,
            config.vector_index_path(),
            config.vector_chunks_path(),
        );
        let cache = ResponseCache::open(config.cache_db_path(), config.cache.enabled)?;
        Ok(Self::from_parts(keyword, vector, cache, config.lore_paths()))
    }

    pub fn from_parts(
        keyword: KeywordIndex,
        vector: VectorIndex,
        cache: ResponseCache,
        lore_sources: Vec<(String, PathBuf)>,
    ) -> Self {
        Self {
            keyword,
            vector,
            cache,
            lore_sources,
        }
    }

    pub fn keyword(&self) -> &KeywordIndex {
        &self.keyword
    }

    pub fn vector(&self) -> &VectorIndex {
        &self.vector
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Build the vector index from sources when nothing was loaded from
    /// disk.  Called once at startup.
    pub async fn ensure_vector_index(&self) -> Result<usize> {
        if !self.vector.is_empty() {
            return Ok(self.vector.len());
        }
        self.rebuild_vector_index().await
    }

    /// Re-embed every lore chunk and every episode from scratch.
    #[instrument(skip(self))]
    pub async fn rebuild_vector_index(&self) -> Result<usize> {
        let lore = collect_lore(&self.lore_sources)?;
        let episodes = self.keyword.list()?;
        self.vector.build_index(lore, &episodes).await
    }

    pub fn list_episodes(&self) -> Result<Vec<Episode>> {
        self.keyword.list()
    }

    /// Delete one episode, drop its chunk, then rebuild the vector index so
    /// both stores agree.
    pub async fn delete_episode(&self, id: i64) -> Result<Option<Episode>> {
        let Some(episode) = self.keyword.delete(id)? else {
            return Ok(None);
        };
        if let Err(err) = self.vector.remove_text(&episode.content) {
            warn!(error = %err, id, "removing episode chunk failed");
        }
        self.rebuild_vector_index().await?;
        Ok(Some(episode))
    }

    /// Delete every episode and rebuild the vector index from lore alone.
    pub async fn clear_all(&self) -> Result<usize> {
        let removed = self.keyword.clear()?;
        self.rebuild_vector_index().await?;
        Ok(removed)
    }

    /// Ingest every `*.txt` file in `dir` as `---`-separated episodes, then
    /// rebuild the vector index to include them.
    pub async fn ingest_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        files.sort();

        let mut added = 0;
        for file in &files {
            added += self.keyword.ingest_text_file(file)?;
        }
        info!(files = files.len(), episodes = added, "episode directory ingested");
        if added > 0 {
            self.rebuild_vector_index().await?;
        }
        Ok(added)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let chunks = self.vector.chunks();
        Ok(MemoryStats {
            episodes: self.keyword.count()?,
            episodes_by_source: self.keyword.counts_by_source()?,
            chunks: chunks.len(),
            lore_chunks: chunks.iter().filter(|c| c.is_lore()).count(),
            vector_file_bytes: self.vector.file_size(),
            cache: self.cache.stats()?,
        })
    }
}
