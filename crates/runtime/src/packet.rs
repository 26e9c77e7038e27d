//! Per-turn prompt assembly.
//!
//! Every block is computed independently and pushed in a fixed order.  The
//! only side effects are read-only queries against the memory indices.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use hearth_config::AppConfig;
use hearth_llm::{Packet, Section};
use hearth_memory::{MemoryManager, truncate_for_display, truncate_str};

use crate::conversation::Turn;
use crate::temporal::TemporalContext;

const HISTORY_DISPLAY_CHARS: usize = 80;
const LORE_DEDUP_PREFIX: usize = 50;

static MEMORY_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(remember|recall|remind|that time|the other day|last time|we talked about|we discussed|you said|you told me|you mentioned|what happened|what did we|when we|tell me about|how was|what was|did you say|did we|forget|forgot|what about)\b|\bhave you\b.*\bforgotten\b",
    )
    .expect("memory intent pattern is valid")
});

/// Does the input ask about something from the past?
pub fn is_memory_intent(input: &str) -> bool {
    MEMORY_INTENT.is_match(&input.trim().to_lowercase())
}

/// Everything about the current turn the builder needs besides the memory
/// indices.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub input: &'a str,
    pub temporal: &'a TemporalContext,
    /// Proximity description when one is due this turn.
    pub proximity: Option<&'a str>,
    pub history: &'a [Turn],
}

#[derive(Debug, Clone)]
pub struct PacketBuilder {
    agent_name: String,
    user_name: String,
    persona: Vec<String>,
    lore_k: usize,
    keyword_limit: usize,
    vector_limit: usize,
    memory_display_chars: usize,
    history_turns: usize,
}

impl PacketBuilder {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            agent_name: config.agent.name.clone(),
            user_name: config.agent.user_name.clone(),
            persona: config.agent.persona.clone(),
            lore_k: config.memory.lore_k,
            keyword_limit: config.memory.keyword_limit,
            vector_limit: config.memory.vector_limit,
            memory_display_chars: config.memory.memory_display_chars,
            history_turns: config.memory.history_turns,
        }
    }

    pub async fn build(&self, memory: &MemoryManager, turn: TurnContext<'_>) -> Packet {
        let mut packet = Packet::new();
        packet.push(Section::Directive, self.directive());
        packet.push(Section::Lore, self.lore_block(memory, turn.input).await);
        packet.push(Section::Temporal, turn.temporal.block());
        if let Some(proximity) = turn.proximity {
            packet.push(Section::Proximity, proximity);
        }
        if is_memory_intent(turn.input) {
            packet.push(Section::Memory, self.memory_block(memory, turn.input).await);
        }
        packet.push(Section::History, self.history_block(turn.history));
        packet.push(Section::UserInput, turn.input);
        packet.push(
            Section::Trigger,
            format!("Start with [{}]: then your dialogue.", self.agent_name),
        );
        packet
    }

    fn directive(&self) -> String {
        let agent = &self.agent_name;
        let mut persona = format!("Your Name: {agent}");
        for line in &self.persona {
            persona.push('\n');
            persona.push_str(line);
        }
        format!(
            "Roleplay as {agent}.\nYour name is {agent}. Use [{agent}] for your responses.\n\n<assistant_persona>\n{persona}\n</assistant_persona>"
        )
    }

    async fn lore_block(&self, memory: &MemoryManager, input: &str) -> String {
        let hits = memory.vector().search(input, self.lore_k * 2).await;

        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        for hit in hits.iter().filter(|h| h.is_lore()) {
            if !seen.insert(truncate_str(&hit.text, LORE_DEDUP_PREFIX)) {
                continue;
            }
            let clean = hit.text.split_whitespace().collect::<Vec<_>>().join(" ");
            if clean.is_empty() {
                continue;
            }
            lines.push(format!("- {clean}"));
            if lines.len() >= self.lore_k {
                break;
            }
        }

        if lines.is_empty() {
            return format!(
                "- {} is a helpful assistant connected to {}.",
                self.agent_name, self.user_name
            );
        }
        lines.join("\n")
    }

    async fn memory_block(&self, memory: &MemoryManager, input: &str) -> String {
        let semantic = memory.vector().search(input, self.vector_limit).await;
        let episodes = memory.keyword().search(input, self.keyword_limit).into_hits();

        let mut seen = HashSet::new();
        let mut bullets = Vec::new();
        let candidates = semantic
            .iter()
            .map(|hit| hit.text.as_str())
            .chain(episodes.iter().map(|ep| ep.content.as_str()));
        for text in candidates {
            let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if flat.is_empty() || !seen.insert(flat.clone()) {
                continue;
            }
            bullets.push(format!("- {}", truncate_for_display(&flat, self.memory_display_chars)));
        }

        info!(
            semantic = semantic.len(),
            episodic = episodes.len(),
            merged = bullets.len(),
            "memory block retrieved"
        );
        let body = if bullets.is_empty() {
            "- No specific memories retrieved.".to_string()
        } else {
            bullets.join("\n")
        };
        format!("Use from this memory block only if required.\n{body}")
    }

    fn history_block(&self, history: &[Turn]) -> String {
        let start = history.len().saturating_sub(self.history_turns);
        let recent = &history[start..];
        if recent.is_empty() {
            return "[No previous conversation]".to_string();
        }
        debug!(turns = recent.len(), "history block");

        let mut lines = Vec::with_capacity(recent.len() * 2);
        for turn in recent {
            lines.push(format!("[User]: {}", clip(&turn.user.text)));
            lines.push(format!("[{}]: {}", self.agent_name, clip(&turn.assistant.text)));
        }
        lines.join("\n")
    }
}

fn clip(text: &str) -> String {
    let cut = truncate_str(text, HISTORY_DISPLAY_CHARS);
    if cut.len() < text.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}
