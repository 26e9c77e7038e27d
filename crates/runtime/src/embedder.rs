use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use hearth_config::AppConfig;
use hearth_llm::{LlmError, OllamaClient};
use hearth_memory::embedding::l2_normalize;
use hearth_memory::{DisabledEmbedder, Embedder, EmbeddingError};

/// Embeddings served by a local Ollama instance.
///
/// The first connection or model failure marks the embedder unavailable for
/// the rest of the process, so a missing model is probed once and every
/// later call short-circuits.
pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
    dimension: usize,
    unavailable: AtomicBool,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dimension,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Relaxed)
    }

    fn mark_unavailable(&self, reason: &str) -> EmbeddingError {
        if !self.unavailable.swap(true, Ordering::Relaxed) {
            warn!(model = %self.model, reason, "embedding model unavailable, vector features disabled");
        }
        EmbeddingError::Unavailable(reason.to_string())
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.is_unavailable() {
            return Err(EmbeddingError::Unavailable(format!("{} previously failed", self.model)));
        }

        let mut vector = match self.client.embed(&self.model, text).await {
            Ok(vector) => vector,
            // Unreachable server or unknown model.
            Err(LlmError::Transport(err)) => return Err(self.mark_unavailable(&err.to_string())),
            Err(LlmError::Status { status: 404, body, .. }) => {
                return Err(self.mark_unavailable(&body));
            }
            Err(err) => return Err(EmbeddingError::Inference(err.to_string())),
        };

        if vector.len() != self.dimension {
            let err = EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            };
            self.mark_unavailable(&err.to_string());
            return Err(err);
        }

        l2_normalize(&mut vector);
        debug!(chars = text.len(), "text embedded");
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// The single embedder shared by the vector index and the proximity
/// detector.
pub fn embedder_from_config(config: &AppConfig) -> Arc<dyn Embedder> {
    if !config.embedding.enabled {
        return Arc::new(DisabledEmbedder {
            dimension: config.embedding.dimension,
        });
    }
    let client = OllamaClient::new(
        config.embedding_base_url(),
        std::time::Duration::from_secs(config.llm.timeout_secs),
    );
    Arc::new(OllamaEmbedder::new(
        client,
        &config.embedding.model,
        config.embedding.dimension,
    ))
}
