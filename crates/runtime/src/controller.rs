//! Traffic control: hold the input, generate, then commit or discard.
//!
//! Nothing is written to the conversation log until a response has passed
//! validation.  Every `cycle_size` commits the window is compressed into
//! long-term memory and cleared, whatever the compressor reports.

use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use hearth_config::AppConfig;
use hearth_llm::{ChatPayload, Generator, LlmRouter, LlmSummarizer, Rejection, ResponseValidator, Summarizer};
use hearth_memory::{MemoryManager, ResponseCache};

use crate::compressor::{CompressionOutcome, CycleCompressor};
use crate::conversation::{ConversationLog, Turn};
use crate::embedder::embedder_from_config;
use crate::packet::{PacketBuilder, TurnContext};
use crate::proximity::ProximityDetector;
use crate::session::Session;
use crate::temporal::{TemporalContext, TimeKeeper};

#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    EmptyInput,
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Committed {
        response: String,
        compression: Option<CompressionOutcome>,
    },
    Discarded {
        reason: DiscardReason,
    },
}

impl TurnOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Capabilities the controller drives.  Built once at startup.
pub struct Collaborators {
    pub memory: Arc<MemoryManager>,
    pub generator: Arc<dyn Generator>,
    pub summarizer: Arc<dyn Summarizer>,
    pub proximity: Option<ProximityDetector>,
}

/// Serve a payload from the cache or the generator, returning the cleaned
/// response only if it passes validation.  Only valid responses are cached.
///
/// Streamed text goes through the same speaker-tag cleanup as the final
/// response.  A cache hit is validated before anything is streamed.
pub async fn generate_with_cache(
    cache: &ResponseCache,
    generator: &dyn Generator,
    validator: &ResponseValidator,
    payload: &ChatPayload,
    stream: Option<mpsc::Sender<String>>,
) -> Result<String, Rejection> {
    match cache.lookup(&payload.system, &payload.user) {
        Ok(Some(hit)) => {
            info!(chars = hit.len(), "cache hit");
            let response = validator.check(&hit)?;
            if let Some(tx) = stream {
                let _ = tx.send(response.clone()).await;
            }
            return Ok(response);
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "cache lookup failed, generating"),
    }

    let raw = match stream {
        Some(tx) => stream_cleaned(generator, validator, payload, tx).await,
        None => generator.generate(payload).await,
    };
    let response = validator.check(&raw)?;

    if let Err(err) = cache.store(&payload.system, &payload.user, &response) {
        warn!(error = %err, "cache store failed");
    }
    Ok(response)
}

/// Stream a generation through a [`hearth_llm::StreamCleaner`] and return the raw text.
async fn stream_cleaned(
    generator: &dyn Generator,
    validator: &ResponseValidator,
    payload: &ChatPayload,
    tx: mpsc::Sender<String>,
) -> String {
    let (raw_tx, mut raw_rx) = mpsc::channel::<String>(64);
    let forward = async {
        let mut cleaner = validator.stream_cleaner();
        while let Some(fragment) = raw_rx.recv().await {
            if let Some(text) = cleaner.push(&fragment) {
                let _ = tx.send(text).await;
            }
        }
        if let Some(text) = cleaner.finish() {
            let _ = tx.send(text).await;
        }
    };
    let (raw, ()) = tokio::join!(generator.generate_stream(payload, raw_tx), forward);
    raw
}

pub struct TrafficController {
    agent_name: String,
    memory: Arc<MemoryManager>,
    generator: Arc<dyn Generator>,
    validator: ResponseValidator,
    builder: PacketBuilder,
    compressor: CycleCompressor,
    proximity: Option<ProximityDetector>,
    clock: TimeKeeper,
    session: Session,
}

impl TrafficController {
    pub fn new(config: &AppConfig, parts: Collaborators) -> Result<Self> {
        let log = ConversationLog::create(config.conversation_log_dir())?;
        info!(path = %log.path().display(), session = %log.session_id(), "session started");
        Ok(Self {
            agent_name: config.agent.name.clone(),
            memory: parts.memory,
            generator: parts.generator,
            validator: ResponseValidator::from_config(config),
            builder: PacketBuilder::from_config(config),
            compressor: CycleCompressor::new(parts.summarizer),
            proximity: parts.proximity,
            clock: TimeKeeper::new(config.timestamp_path()),
            session: Session::new(log, config.memory.cycle_size, config.memory.history_turns),
        })
    }

    /// Wire the full production stack: one shared embedder, both memory
    /// indices, the configured LLM provider and the proximity anchors.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let embedder = embedder_from_config(config);
        let memory = Arc::new(MemoryManager::open(config, embedder.clone())?);
        let chunks = memory.ensure_vector_index().await?;
        info!(chunks, "memory ready");

        let generator: Arc<dyn Generator> = Arc::new(LlmRouter::from_config(config));
        let summarizer = Arc::new(LlmSummarizer::new(
            generator.clone(),
            &config.llm.fallback_message,
        ));
        let proximity = if config.proximity.enabled {
            Some(ProximityDetector::new(embedder, config.proximity.threshold).await)
        } else {
            None
        };

        Self::new(
            config,
            Collaborators {
                memory,
                generator,
                summarizer,
                proximity,
            },
        )
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Process one user input end to end.  When `stream` is set, response
    /// text is forwarded as it is generated.
    #[instrument(skip(self, input, stream), fields(turn = self.session.session_turns() + 1, cycle = self.session.cycle_number()))]
    pub async fn handle_input(
        &mut self,
        input: &str,
        stream: Option<mpsc::Sender<String>>,
    ) -> TurnOutcome {
        let input = input.trim();
        if input.is_empty() {
            debug!("DISCARD empty input");
            return TurnOutcome::Discarded {
                reason: DiscardReason::EmptyInput,
            };
        }
        info!(chars = input.len(), "HOLD");

        // Proximity is restored if the turn is discarded so a resubmission
        // sees the same state.
        let proximity_snapshot = self.session.proximity.clone();
        if let Some(detector) = &self.proximity {
            let previous = self.session.last_user_message().map(|m| m.text.clone());
            detector
                .detect_state(&mut self.session.proximity, input, previous.as_deref())
                .await;
        }
        let first_turn = self.session.is_first_turn();
        let proximity = match self.proximity {
            Some(_) => self.session.proximity.get_proximity_block(first_turn, &self.agent_name),
            None => String::new(),
        };

        let now = Local::now();
        let temporal = TemporalContext::new(now, self.clock.last_interaction());
        let packet = self
            .builder
            .build(
                &self.memory,
                TurnContext {
                    input,
                    temporal: &temporal,
                    proximity: Some(proximity.as_str()).filter(|p| !p.is_empty()),
                    history: self.session.history(),
                },
            )
            .await;
        debug!(packet = %packet.render(), "packet assembled");
        let payload = packet.to_payload(&self.agent_name);

        let response = match generate_with_cache(
            self.memory.cache(),
            self.generator.as_ref(),
            &self.validator,
            &payload,
            stream,
        )
        .await
        {
            Ok(response) => response,
            Err(rejection) => {
                warn!(reason = %rejection, "DISCARD");
                self.session.proximity = proximity_snapshot;
                return TurnOutcome::Discarded {
                    reason: DiscardReason::Rejected(rejection),
                };
            }
        };

        let cycle_full = self.session.commit(Turn::new(input, response.clone()));
        if let Err(err) = self.clock.record(now) {
            warn!(error = %err, "timestamp update failed");
        }
        info!(
            turn = self.session.turn_count(),
            cycle_size = self.session.window().capacity(),
            "COMMIT"
        );

        let compression = if cycle_full {
            let cycle = self.session.cycle_number();
            let raw = self.session.window().raw_text();
            let outcome = self.compressor.compress(&self.memory, &raw, cycle).await;
            self.session.close_cycle();
            Some(outcome)
        } else {
            None
        };

        TurnOutcome::Committed {
            response,
            compression,
        }
    }

    /// Finalize the session.  Safe to call from every exit path; only the
    /// first call does anything.
    pub fn shutdown(&mut self) -> bool {
        self.session.finalize()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
