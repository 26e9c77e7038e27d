//! Deterministic stand-ins for the model-backed capabilities.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::mpsc;

use hearth_llm::{ChatPayload, Generator, Summarizer};
use hearth_memory::{Embedder, EmbeddingError};

const CONCEPTS: [&[&str]; 4] = [
    &["together", "face", "room", "beside", "hug"],
    &["texting", "phone", "discord", "messaging", "remotely"],
    &["leaving", "goodbye", "bye", "departing"],
    &["arriving", "approaching", "closer", "entering", "sit"],
];
const CONCEPT_WEIGHT: f32 = 3.0;
const WORD_BUCKETS: usize = 16;

/// Four proximity-concept axes plus hashed word buckets.  Anchor documents
/// only populate the concept axes, so neutral text scores zero against them.
pub(crate) struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut v = vec![0.0; self.dimension()];
        let anchor = text.starts_with("search_document:");
        let lowered = text.to_lowercase();
        let words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !matches!(*w, "search" | "query" | "document"));
        for word in words {
            if let Some(axis) = CONCEPTS.iter().position(|list| list.contains(&word)) {
                v[axis] += CONCEPT_WEIGHT;
            } else if !anchor {
                let bucket = word.bytes().map(usize::from).sum::<usize>() % WORD_BUCKETS;
                v[CONCEPTS.len() + bucket] += 1.0;
            }
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        CONCEPTS.len() + WORD_BUCKETS
    }
}

/// Replies from a queue, repeating the last reply once the queue drains.
pub(crate) struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
    payloads: Mutex<Vec<ChatPayload>>,
}

impl ScriptedGenerator {
    pub(crate) fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_payload(&self) -> Option<ChatPayload> {
        self.payloads.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, payload: &ChatPayload) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.replies.lock().unwrap().pop_front() {
            *last = next;
        }
        last.clone()
    }

    /// Streams the reply in three-character fragments.
    async fn generate_stream(&self, payload: &ChatPayload, tx: mpsc::Sender<String>) -> String {
        let text = self.generate(payload).await;
        let chars: Vec<char> = text.chars().collect();
        for fragment in chars.chunks(3) {
            let _ = tx.send(fragment.iter().collect()).await;
        }
        text
    }
}

pub(crate) struct FixedSummarizer {
    pub(crate) summary: Option<String>,
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _raw: &str) -> Result<String> {
        self.summary
            .clone()
            .ok_or_else(|| anyhow!("summarizer offline"))
    }
}
