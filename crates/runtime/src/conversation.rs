//! Committed conversation state: the in-memory window that feeds the
//! compressor and the append-only per-session transcript on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Turn types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A user message and the assistant reply that was committed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub user: Message,
    pub assistant: Message,
}

impl Turn {
    pub fn new(user_text: impl Into<String>, assistant_text: impl Into<String>) -> Self {
        Self {
            user: Message::new(Role::User, user_text),
            assistant: Message::new(Role::Assistant, assistant_text),
        }
    }
}

// ── Window ───────────────────────────────────────────────────────────────────

/// Turns committed since the last compression cycle.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    turns: Vec<Turn>,
    capacity: usize,
}

impl ConversationWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a turn.  Returns `true` once the window is full.
    pub fn push(&mut self, turn: Turn) -> bool {
        if self.turns.len() >= self.capacity {
            self.turns.remove(0);
        }
        self.turns.push(turn);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.turns.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Transcript in the `USER:` / `AI:` line format the summarizer expects.
    pub fn raw_text(&self) -> String {
        self.turns
            .iter()
            .flat_map(|t| {
                [
                    format!("USER: {}", t.user.text),
                    format!("AI: {}", t.assistant.text),
                ]
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Session transcript ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    SessionStart {
        session_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Message(Message),
    SessionEnd {
        ended_at: DateTime<Utc>,
        turns: usize,
        cycles: usize,
    },
}

/// Append-only JSONL transcript, one file per session.
#[derive(Debug)]
pub struct ConversationLog {
    path: PathBuf,
    session_id: Uuid,
}

impl ConversationLog {
    /// Create `convo_<timestamp>.jsonl` in `dir` and write its header.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let session_id = Uuid::new_v4();

        // Two sessions in the same second get distinct files.
        let mut path = dir.join(format!("convo_{stamp}.jsonl"));
        if path.exists() {
            let id = session_id.simple().to_string();
            path = dir.join(format!("convo_{stamp}_{}.jsonl", &id[..8]));
        }

        let log = Self { path, session_id };
        log.append(&LogRecord::SessionStart {
            session_id,
            started_at: Utc::now(),
        })?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize LogRecord")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open conversation log {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Write both halves of a committed turn.
    pub fn append_turn(&self, turn: &Turn) -> Result<()> {
        self.append(&LogRecord::Message(turn.user.clone()))?;
        self.append(&LogRecord::Message(turn.assistant.clone()))
    }

    pub fn finish(&self, turns: usize, cycles: usize) -> Result<()> {
        self.append(&LogRecord::SessionEnd {
            ended_at: Utc::now(),
            turns,
            cycles,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn window_reports_full_at_capacity() {
        let mut window = ConversationWindow::new(2);
        assert!(!window.push(Turn::new("a", "b")));
        assert!(window.push(Turn::new("c", "d")));
        assert_eq!(window.len(), 2);
        window.clear();
        assert!(window.is_empty());
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut window = ConversationWindow::new(2);
        for i in 0..4 {
            window.push(Turn::new(format!("u{i}"), "r"));
        }
        assert_eq!(window.len(), 2);
        assert_eq!(window.turns()[0].user.text, "u2");
    }

    #[test]
    fn raw_text_alternates_speakers() {
        let mut window = ConversationWindow::new(5);
        window.push(Turn::new("I adopted a cat", "What's her name?"));
        window.push(Turn::new("Miso", "Lovely."));
        assert_eq!(
            window.raw_text(),
            "USER: I adopted a cat\nAI: What's her name?\nUSER: Miso\nAI: Lovely."
        );
    }

    #[test]
    fn log_writes_header_turns_and_footer() {
        let dir = TempDir::new().unwrap();
        let log = ConversationLog::create(dir.path().join("logs")).unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("convo_") && name.ends_with(".jsonl"));

        log.append_turn(&Turn::new("hello", "hi there")).unwrap();
        log.finish(1, 0).unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        let kinds: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, ["session_start", "message", "message", "session_end"]);
        assert!(raw.contains("\"role\":\"assistant\""));
    }

    #[test]
    fn sessions_in_same_second_get_distinct_files() {
        let dir = TempDir::new().unwrap();
        let a = ConversationLog::create(dir.path()).unwrap();
        let b = ConversationLog::create(dir.path()).unwrap();
        assert_ne!(a.path(), b.path());
        assert_ne!(a.session_id(), b.session_id());
    }
}
