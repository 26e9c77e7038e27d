use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    /// Free-form persona lines rendered inside the system directive.
    pub persona: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "AI".to_string(),
            user_name: "User".to_string(),
            persona: vec![
                "Relationship: Assistant to User".to_string(),
                "Identity: A helpful AI assistant".to_string(),
                "Background: Experienced in many conversations and interactions".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
    /// Attempts per generation call before the fallback message is returned.
    pub max_retries: u32,
    /// Placeholder returned when every attempt fails.  The validator rejects
    /// it, so a turn that ends here is discarded.
    pub fallback_message: String,
    /// Print tokens as they arrive instead of waiting for the full reply.
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            temperature: 0.7,
            max_output_tokens: 1000,
            timeout_secs: 60,
            max_retries: 3,
            fallback_message:
                "*AI looks at you, seemingly lost in a daydream, and doesn't respond.*"
                    .to_string(),
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub model: String,
    /// Falls back to `llm.ollama_base_url` when empty.
    pub base_url: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "nomic-embed-text".to_string(),
            base_url: String::new(),
            dimension: 768,
        }
    }
}

/// One static text file indexed into the vector store at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreSource {
    /// Tag stored on every chunk, e.g. `lore/self`.
    pub source: String,
    /// Path relative to `memory.data_dir` (absolute paths are used as-is).
    pub path: String,
}

impl LoreSource {
    fn new(source: &str, path: &str) -> Self {
        Self {
            source: source.to_string(),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub data_dir: String,
    /// Committed turns per compression cycle.
    pub cycle_size: usize,
    /// Lore chunks injected per turn.
    pub lore_k: usize,
    /// Keyword-index hits merged into the memory block.
    pub keyword_limit: usize,
    /// Vector-index hits merged into the memory block.
    pub vector_limit: usize,
    /// Each retrieved memory is cut to this many characters.
    pub memory_display_chars: usize,
    pub history_turns: usize,
    pub lore: Vec<LoreSource>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: ".hearth".to_string(),
            cycle_size: 5,
            lore_k: 4,
            keyword_limit: 3,
            vector_limit: 5,
            memory_display_chars: 150,
            history_turns: 5,
            lore: vec![
                LoreSource::new("lore/self", "lore/self.md"),
                LoreSource::new("lore/user", "lore/user.md"),
                LoreSource::new("lore/relationship", "lore/relationship.md"),
                LoreSource::new("semantic/memory", "semantic/memory.md"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub enabled: bool,
    /// Minimum anchor similarity before a state change is signalled.
    pub threshold: f32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Relative paths resolve against `memory.data_dir`.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs/system".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub proximity: ProximityConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Parse `path` (defaults when missing) and apply overrides looked up
    /// through `var` instead of the process environment.
    pub fn load_with_env(path: impl AsRef<Path>, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Some(value) = var("OLLAMA_BASE_URL").filter(|v| !v.is_empty()) {
            config.llm.provider = "ollama".to_string();
            config.llm.ollama_base_url = value;
        }

        if let Some(dir) = var("HEARTH_DATA_DIR").filter(|v| !v.is_empty()) {
            config.memory.data_dir = dir;
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }

    pub fn embedding_base_url(&self) -> &str {
        if self.embedding.base_url.trim().is_empty() {
            &self.llm.ollama_base_url
        } else {
            &self.embedding.base_url
        }
    }

    // ── derived paths ────────────────────────────────────────────────────────

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.memory.data_dir)
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn episodes_db_path(&self) -> PathBuf {
        self.data_dir().join("episodes.db")
    }

    pub fn vector_index_path(&self) -> PathBuf {
        self.data_dir().join("vector.index")
    }

    pub fn vector_chunks_path(&self) -> PathBuf {
        self.data_dir().join("vector_chunks.json")
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir().join("responses.redb")
    }

    pub fn timestamp_path(&self) -> PathBuf {
        self.data_dir().join("timestamps.json")
    }

    pub fn conversation_log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn system_log_dir(&self) -> PathBuf {
        self.resolve(&self.telemetry.log_dir)
    }

    /// Lore sources with their paths resolved against the data directory.
    pub fn lore_paths(&self) -> Vec<(String, PathBuf)> {
        self.memory
            .lore
            .iter()
            .map(|lore| (lore.source.clone(), self.resolve(&lore.path)))
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
