pub mod packet;
pub mod summarize;
pub mod validate;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use hearth_config::AppConfig;

pub use packet::{Packet, Section};
pub use summarize::{LlmSummarizer, Summarizer};
pub use validate::{Rejection, ResponseValidator, StreamCleaner};

const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Delay unit between attempts; attempt `n` waits `n` units.
const BACKOFF_UNIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{0} response contained no text")]
    EmptyResponse(&'static str),

    #[error("OPENROUTER_API_KEY is not set")]
    MissingApiKey,
}

/// What the model actually receives for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub system: String,
    pub user: String,
    /// Per-call override of the configured temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Per-call override of the configured output budget.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatPayload {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Text generation capability.
///
/// Implementations own their retry policy and never fail outright: when
/// every attempt is exhausted they return a fallback placeholder, which the
/// response validator rejects.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, payload: &ChatPayload) -> String;

    /// Stream chunks into `tx` as they arrive and return the full text.
    async fn generate_stream(&self, payload: &ChatPayload, tx: mpsc::Sender<String>) -> String {
        let text = self.generate(payload).await;
        let _ = tx.send(text.clone()).await;
        text
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("openrouter") {
            Self::OpenRouter
        } else {
            Self::Ollama
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub provider: Provider,
    pub ollama_model: String,
    pub openrouter_model: String,
    pub ollama_base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub fallback_message: String,
}

impl GenerationSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            provider: Provider::from_name(&config.llm.provider),
            ollama_model: config.llm.ollama_model.clone(),
            openrouter_model: config.llm.openrouter_model.clone(),
            ollama_base_url: config.llm.ollama_base_url.clone(),
            temperature: config.llm.temperature,
            max_output_tokens: config.llm.max_output_tokens,
            timeout: Duration::from_secs(config.llm.timeout_secs),
            max_retries: config.llm.max_retries.max(1),
            fallback_message: config.llm.fallback_message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn body(&self, model: &str, payload: &ChatPayload, settings: &GenerationSettings, stream: bool) -> serde_json::Value {
        json!({
            "model": model,
            "system": payload.system,
            "prompt": payload.user,
            "stream": stream,
            "options": {
                "temperature": payload.temperature.unwrap_or(settings.temperature),
                "num_predict": payload.max_tokens.unwrap_or(settings.max_output_tokens),
            }
        })
    }

    async fn generate(&self, model: &str, payload: &ChatPayload, settings: &GenerationSettings) -> Result<String, LlmError> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(endpoint)
            .json(&self.body(model, payload, settings, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: "ollama",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: serde_json::Value = response.json().await?;
        body.get("response")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .ok_or(LlmError::EmptyResponse("ollama"))
    }

    async fn generate_stream(
        &self,
        model: &str,
        payload: &ChatPayload,
        settings: &GenerationSettings,
        tx: &mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(endpoint)
            .json(&self.body(model, payload, settings, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: "ollama",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        read_stream("ollama", response, tx, ollama_delta).await
    }

    /// Fetch one embedding from `/api/embeddings`.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, LlmError> {
        let endpoint = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(endpoint)
            .json(&json!({ "model": model, "prompt": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: "ollama",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: serde_json::Value = response.json().await?;
        let vector: Vec<f32> = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
            .unwrap_or_default();
        if vector.is_empty() {
            return Err(LlmError::EmptyResponse("ollama embeddings"));
        }
        Ok(vector)
    }
}

impl OpenRouterClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }

    fn api_key() -> Result<String, LlmError> {
        std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)
    }

    fn body(&self, model: &str, payload: &ChatPayload, settings: &GenerationSettings, stream: bool) -> serde_json::Value {
        json!({
            "model": model,
            "messages": [
                {"role": "system", "content": payload.system},
                {"role": "user", "content": payload.user}
            ],
            "temperature": payload.temperature.unwrap_or(settings.temperature),
            "max_tokens": payload.max_tokens.unwrap_or(settings.max_output_tokens),
            "stream": stream
        })
    }

    async fn send(&self, model: &str, payload: &ChatPayload, settings: &GenerationSettings, stream: bool) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(OPENROUTER_CHAT_URL)
            .bearer_auth(Self::api_key()?)
            .header("HTTP-Referer", "https://hearth.local")
            .header("X-Title", "Hearth")
            .json(&self.body(model, payload, settings, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: "openrouter",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    async fn generate(&self, model: &str, payload: &ChatPayload, settings: &GenerationSettings) -> Result<String, LlmError> {
        let body: serde_json::Value = self.send(model, payload, settings, false).await?.json().await?;
        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .ok_or(LlmError::EmptyResponse("openrouter"))
    }

    async fn generate_stream(
        &self,
        model: &str,
        payload: &ChatPayload,
        settings: &GenerationSettings,
        tx: &mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let response = self.send(model, payload, settings, true).await?;

        read_stream("openrouter", response, tx, openrouter_delta).await
    }
}

/// Reassembles newline-delimited records from arbitrarily split network
/// chunks.  Bytes are only decoded once a full line is available, so a
/// record or a multibyte character cut between chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever followed the last newline when the stream ended.
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Text carried by one Ollama NDJSON record.
fn ollama_delta(line: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(line).ok()?;
    json.get("response")?.as_str().map(ToString::to_string)
}

/// Text carried by one OpenRouter SSE `data:` line.
fn openrouter_delta(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return None;
    }
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(ToString::to_string)
}

/// Forward every text delta of a streamed response into `tx` and return the
/// concatenated text.  A transport error after some text has arrived keeps
/// the partial text.
async fn read_stream(
    provider: &'static str,
    mut response: reqwest::Response,
    tx: &mpsc::Sender<String>,
    delta: fn(&str) -> Option<String>,
) -> Result<String, LlmError> {
    let mut lines = LineBuffer::default();
    let mut full_response = String::new();
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) if !full_response.is_empty() => {
                warn!(provider, error = %err, "stream cut short, keeping partial text");
                break;
            }
            Err(err) => return Err(err.into()),
        };
        for line in lines.push(&chunk) {
            forward_delta(delta(&line), &mut full_response, tx).await;
        }
    }
    if let Some(line) = lines.finish() {
        forward_delta(delta(&line), &mut full_response, tx).await;
    }
    Ok(full_response)
}

async fn forward_delta(content: Option<String>, full_response: &mut String, tx: &mpsc::Sender<String>) {
    let Some(content) = content.filter(|c| !c.is_empty()) else {
        return;
    };
    full_response.push_str(&content);
    let _ = tx.send(content).await;
}

/// Routes generation to the configured provider with retry and fallback.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
    settings: GenerationSettings,
}

impl LlmRouter {
    pub fn new(settings: GenerationSettings) -> Self {
        Self {
            ollama: OllamaClient::new(settings.ollama_base_url.clone(), settings.timeout),
            openrouter: OpenRouterClient::new(settings.timeout),
            settings,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(GenerationSettings::from_config(config))
    }

    async fn attempt(&self, payload: &ChatPayload, tx: Option<&mpsc::Sender<String>>) -> Result<String, LlmError> {
        let s = &self.settings;
        match (s.provider, tx) {
            (Provider::Ollama, None) => self.ollama.generate(&s.ollama_model, payload, s).await,
            (Provider::Ollama, Some(tx)) => {
                self.ollama.generate_stream(&s.ollama_model, payload, s, tx).await
            }
            (Provider::OpenRouter, None) => {
                self.openrouter.generate(&s.openrouter_model, payload, s).await
            }
            (Provider::OpenRouter, Some(tx)) => {
                self.openrouter.generate_stream(&s.openrouter_model, payload, s, tx).await
            }
        }
    }
}

#[async_trait]
impl Generator for LlmRouter {
    async fn generate(&self, payload: &ChatPayload) -> String {
        with_retries(
            self.settings.max_retries,
            BACKOFF_UNIT,
            &self.settings.fallback_message,
            move |_| self.attempt(payload, None),
        )
        .await
    }

    async fn generate_stream(&self, payload: &ChatPayload, tx: mpsc::Sender<String>) -> String {
        let tx = &tx;
        with_retries(
            self.settings.max_retries,
            BACKOFF_UNIT,
            &self.settings.fallback_message,
            move |_| self.attempt(payload, Some(tx)),
        )
        .await
    }
}

/// Run `attempt` up to `max_retries` times with linear backoff, treating an
/// error or blank text as a failed attempt.  Returns `fallback` when every
/// attempt fails.
pub async fn with_retries<F, Fut>(max_retries: u32, backoff: Duration, fallback: &str, mut attempt: F) -> String
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<String, LlmError>>,
{
    let max_retries = max_retries.max(1);
    for n in 1..=max_retries {
        match attempt(n).await {
            Ok(text) if !text.trim().is_empty() => {
                debug!(attempt = n, chars = text.len(), "generation succeeded");
                return text;
            }
            Ok(_) => warn!(attempt = n, "generation returned empty text"),
            Err(err) => warn!(attempt = n, error = %err, "generation attempt failed"),
        }
        if n < max_retries {
            tokio::time::sleep(backoff * n).await;
        }
    }
    error!(attempts = max_retries, "generation retries exhausted, using fallback");
    fallback.to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let text = with_retries(3, Duration::ZERO, "fallback", |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(LlmError::EmptyResponse("test"))
                } else {
                    Ok("hello".to_string())
                }
            }
        })
        .await;
        assert_eq!(text, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn blank_text_counts_as_failure() {
        let text = with_retries(2, Duration::ZERO, "fallback", |_| async {
            Ok("   ".to_string())
        })
        .await;
        assert_eq!(text, "fallback");
    }

    #[tokio::test]
    async fn exhausted_retries_return_fallback() {
        let calls = AtomicU32::new(0);
        let text = with_retries(3, Duration::ZERO, "*lost in a daydream*", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::MissingApiKey) }
        })
        .await;
        assert_eq!(text, "*lost in a daydream*");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let calls = AtomicU32::new(0);
        with_retries(0, Duration::ZERO, "f", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("ok".to_string()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = AppConfig::default();
        config.llm.provider = "OpenRouter".to_string();
        config.llm.max_retries = 0;
        let settings = GenerationSettings::from_config(&config);
        assert_eq!(settings.provider, Provider::OpenRouter);
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.timeout, Duration::from_secs(60));
    }

    /// Serve one request with a chunked body, flushing each part separately.
    async fn serve_chunked(parts: Vec<Vec<u8>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\n\
                      transfer-encoding: chunked\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for part in parts {
                let mut frame = format!("{:x}\r\n", part.len()).into_bytes();
                frame.extend_from_slice(&part);
                frame.extend_from_slice(b"\r\n");
                socket.write_all(&frame).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn ollama_stream_reassembles_records_split_across_chunks() {
        let mut second = b"lo\"}\n{\"response\":\" w".to_vec();
        second.push(0xC3);
        let mut third = vec![0xB6];
        third.extend_from_slice(b"rld\"}\n{\"response\":\"!\"}");
        let base_url = serve_chunked(vec![b"{\"response\":\"Hel".to_vec(), second, third]).await;

        let client = OllamaClient::new(base_url, Duration::from_secs(5));
        let settings = GenerationSettings::from_config(&AppConfig::default());
        let (tx, mut rx) = mpsc::channel(16);
        let text = client
            .generate_stream("test-model", &ChatPayload::new("sys", "hi"), &settings, &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(text, "Hello wörld!");
        let mut streamed = String::new();
        while let Some(chunk) = rx.recv().await {
            streamed.push_str(&chunk);
        }
        assert_eq!(streamed, text);
    }

    #[test]
    fn line_buffer_holds_partial_lines_and_split_characters() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        let mut tail = b":1}\n\ndata: caf".to_vec();
        tail.push(0xC3);
        assert_eq!(lines.push(&tail), vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(lines.push(&[0xA9]), Vec::<String>::new());
        assert_eq!(lines.finish().as_deref(), Some("data: café"));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn openrouter_delta_reads_sse_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(openrouter_delta(line).as_deref(), Some("Hi"));
        assert_eq!(openrouter_delta("data: [DONE]"), None);
        assert_eq!(openrouter_delta(": keep-alive"), None);
        assert_eq!(ollama_delta(r#"{"response":"x","done":false}"#).as_deref(), Some("x"));
    }

    #[test]
    fn payload_overrides_default_to_none() {
        let payload = ChatPayload::new("sys", "user");
        assert!(payload.temperature.is_none());
        assert!(payload.max_tokens.is_none());
    }
}
