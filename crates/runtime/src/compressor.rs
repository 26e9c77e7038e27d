use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use hearth_llm::Summarizer;
use hearth_memory::MemoryManager;

/// Source tag for the episode written at the end of `cycle`.
pub fn cycle_source(cycle: usize) -> String {
    format!("summarizer_cycle_{cycle:03}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOutcome {
    pub cycle: usize,
    pub summary: Option<String>,
    pub episode_id: Option<i64>,
    pub chunk_indexed: bool,
}

impl CompressionOutcome {
    fn skipped(cycle: usize) -> Self {
        Self {
            cycle,
            summary: None,
            episode_id: None,
            chunk_indexed: false,
        }
    }

    /// Both indices received the compressed sentence.
    pub fn is_complete(&self) -> bool {
        self.episode_id.is_some() && self.chunk_indexed
    }
}

/// Folds a closed conversation window into one long-term memory sentence.
pub struct CycleCompressor {
    summarizer: Arc<dyn Summarizer>,
}

impl CycleCompressor {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Summarize `raw` and write the sentence to both indices.  The two
    /// writes are independent: either may fail without undoing the other,
    /// and no failure is returned to the caller.
    #[instrument(skip(self, memory, raw), fields(chars = raw.len()))]
    pub async fn compress(&self, memory: &MemoryManager, raw: &str, cycle: usize) -> CompressionOutcome {
        if raw.trim().is_empty() {
            return CompressionOutcome::skipped(cycle);
        }

        let summary = match self.summarizer.summarize(raw).await {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, cycle, "summarization failed, cycle not stored");
                return CompressionOutcome::skipped(cycle);
            }
        };

        let source = cycle_source(cycle);
        let episode_id = match memory.keyword().add_episode(&summary, &source) {
            Ok(episode) => {
                info!(id = episode.id, source = %source, "episode added");
                Some(episode.id)
            }
            Err(err) => {
                warn!(error = %err, source = %source, "keyword index write failed");
                None
            }
        };

        let chunk_source = format!("episode/{source}");
        let chunk_indexed = memory.vector().add_chunk(&summary, &chunk_source).await;
        if chunk_indexed {
            info!(source = %chunk_source, "chunk indexed");
        } else {
            warn!(source = %chunk_source, "vector index write skipped");
        }

        info!(cycle, episode = ?episode_id, chunk_indexed, "cycle compressed");
        CompressionOutcome {
            cycle,
            summary: Some(summary),
            episode_id,
            chunk_indexed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedSummarizer, KeywordEmbedder};
    use hearth_config::AppConfig;
    use hearth_memory::DisabledEmbedder;
    use hearth_memory::Embedder;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, embedder: Arc<dyn Embedder>) -> MemoryManager {
        let mut config = AppConfig::default();
        config.memory.data_dir = dir.path().display().to_string();
        MemoryManager::open(&config, embedder).unwrap()
    }

    fn compressor(summary: Option<&str>) -> CycleCompressor {
        CycleCompressor::new(Arc::new(FixedSummarizer {
            summary: summary.map(str::to_string),
        }))
    }

    #[test]
    fn source_is_zero_padded() {
        assert_eq!(cycle_source(7), "summarizer_cycle_007");
    }

    #[tokio::test]
    async fn summary_lands_in_both_indices() {
        let dir = TempDir::new().unwrap();
        let memory = manager(&dir, Arc::new(KeywordEmbedder));
        let outcome = compressor(Some("Sam adopted a cat named Miso."))
            .compress(&memory, "USER: I got a cat\nAI: Name?", 1)
            .await;
        assert!(outcome.is_complete());

        let hits = memory.keyword().search("Miso", 3).into_hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(Some(hits[0].id), outcome.episode_id);
        assert_eq!(hits[0].source, "summarizer_cycle_001");

        let semantic = memory.vector().search("cat named Miso", 1).await;
        assert_eq!(semantic[0].text, "Sam adopted a cat named Miso.");
        assert_eq!(semantic[0].source, "episode/summarizer_cycle_001");
    }

    #[tokio::test]
    async fn vector_failure_keeps_episode() {
        let dir = TempDir::new().unwrap();
        let memory = manager(&dir, Arc::new(DisabledEmbedder { dimension: 768 }));
        let outcome = compressor(Some("Sam likes rain."))
            .compress(&memory, "USER: rain\nAI: nice", 2)
            .await;
        assert!(outcome.episode_id.is_some());
        assert!(!outcome.chunk_indexed);
        assert_eq!(memory.keyword().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn summarizer_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let memory = manager(&dir, Arc::new(KeywordEmbedder));
        let outcome = compressor(None).compress(&memory, "USER: hi\nAI: hey", 3).await;
        assert_eq!(outcome.summary, None);
        assert_eq!(memory.keyword().count().unwrap(), 0);
        assert!(memory.vector().is_empty());
    }
}
