use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::debug;

use crate::{ChatPayload, Generator};

const COMPRESSION_PROMPT: &str = "You are a memory compression system. Summarize the conversation \
below in exactly one sentence focusing on facts, preferences, and emotional shifts. \
Write in the third person and do not add commentary.";

const COMPRESSION_TEMPERATURE: f32 = 0.3;
const COMPRESSION_MAX_TOKENS: u32 = 256;

/// Turns a raw conversation transcript into a single-sentence episode.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, raw: &str) -> Result<String>;
}

/// Summarizer backed by the same generator used for dialogue.
pub struct LlmSummarizer {
    generator: Arc<dyn Generator>,
    fallback: String,
}

impl LlmSummarizer {
    pub fn new(generator: Arc<dyn Generator>, fallback: impl Into<String>) -> Self {
        Self {
            generator,
            fallback: fallback.into(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, raw: &str) -> Result<String> {
        let mut payload = ChatPayload::new(COMPRESSION_PROMPT, raw);
        payload.temperature = Some(COMPRESSION_TEMPERATURE);
        payload.max_tokens = Some(COMPRESSION_MAX_TOKENS);

        let text = self.generator.generate(&payload).await;
        let summary = text.split_whitespace().collect::<Vec<_>>().join(" ");

        if summary.is_empty() {
            bail!("summarizer returned no text");
        }
        if summary == self.fallback.trim() || summary.starts_with("[Error") {
            bail!("summarizer generation failed");
        }
        debug!(chars = summary.len(), "conversation compressed");
        Ok(summary)
    }
}
