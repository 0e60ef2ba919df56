//! Chat generation backends.
//!
//! Both the `ollama` and `openai` providers speak the OpenAI-compatible
//! `POST /v1/chat/completions` endpoint with `stream: true` and are served by
//! one [`ChatCompletionsBackend`]. Before the first request the backend checks
//! that the server answers `GET /v1/models` and lists the configured model.
//!
//! Streamed responses are parsed from SSE `data:` lines on a spawned task
//! that feeds a bounded channel. The task stops at `data: [DONE]`, at a
//! non-null `finish_reason`, or as soon as the consumer drops the stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use buildcode_harness_core::compose::{ChatMessage, GenerationBackend, TokenStream};
use buildcode_harness_core::{Error, Result};

use crate::config::GenerationConfig;

const CHANNEL_CAPACITY: usize = 32;

/// A generator that refuses to generate.
pub struct DisabledGenerator;

#[async_trait]
impl GenerationBackend for DisabledGenerator {
    fn model_id(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
        Err(Error::GenerationBackend(
            "generation provider is disabled; set [generation].provider".into(),
        ))
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    id: String,
}

/// Streaming client for an OpenAI-compatible chat completions endpoint.
pub struct ChatCompletionsBackend {
    label: &'static str,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
    ready: OnceCell<()>,
}

impl ChatCompletionsBackend {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required"))?;

        let (label, default_url, api_key) = match config.provider.as_str() {
            "ollama" => ("Ollama", "http://localhost:11434", None),
            "openai" => match std::env::var("OPENAI_API_KEY") {
                Ok(key) => ("OpenAI", "https://api.openai.com", Some(key)),
                Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
            },
            other => bail!("Unknown generation provider: {}", other),
        };
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| default_url.to_string())
            .trim_end_matches('/')
            .to_string();

        // No overall request timeout: it would cut long streams short.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            label,
            base_url,
            model,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
            ready: OnceCell::new(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    /// Whether the server answers `GET /v1/models`.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .authorized(self.client.get(&url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(provider = self.label, error = %e, "health check failed");
                false
            }
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .authorized(self.client.get(&url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(Error::generation)?;
        if !resp.status().is_success() {
            return Err(Error::GenerationBackend(format!(
                "{} model list failed: {}",
                self.label,
                resp.status()
            )));
        }
        let models: ModelsResponse = resp.json().await.map_err(Error::generation)?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                if !self.health_check().await {
                    return Err(Error::GenerationBackend(format!(
                        "{} is not reachable at {}",
                        self.label, self.base_url
                    )));
                }
                let models = self.list_models().await?;
                if !models.iter().any(|m| m == &self.model) {
                    return Err(Error::GenerationBackend(format!(
                        "model '{}' is not available on {}; pull or enable it first",
                        self.model, self.label
                    )));
                }
                info!(provider = self.label, model = %self.model, "generation backend ready");
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl GenerationBackend for ChatCompletionsBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        self.ensure_ready().await?;

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let res = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(Error::generation)?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(Error::GenerationBackend(format!(
                "{} chat error {}: {}",
                self.label, status, text
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(CHANNEL_CAPACITY);
        let mut stream = res.bytes_stream();
        let label = self.label;

        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider = label, "consumer dropped; stopping generation");
                        return;
                    }
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(bytes)) => {
                        buffer.extend(&bytes);
                        while let Some(line) = buffer.next_line() {
                            match parse_sse_line(&line) {
                                SseLine::Token(token) => {
                                    if tx.send(Ok(token)).await.is_err() {
                                        return;
                                    }
                                }
                                SseLine::Done => return,
                                SseLine::Skip => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(Error::GenerationBackend(format!(
                                "{} stream interrupted: {}",
                                label, e
                            ))))
                            .await;
                        return;
                    }
                    None => {
                        // Flush a final line without trailing newline.
                        if let SseLine::Token(token) = parse_sse_line(&buffer.take_rest()) {
                            let _ = tx.send(Ok(token)).await;
                        }
                        return;
                    }
                }
            }
        });

        Ok(receiver_stream(rx))
    }
}

fn receiver_stream(rx: mpsc::Receiver<Result<String>>) -> TokenStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Raw response bytes split into lines.
///
/// Network chunks may end inside a multi-byte character, so bytes are only
/// decoded once a whole line is buffered. `\n` never occurs inside a UTF-8
/// sequence.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        Some(decode_line(line))
    }

    fn take_rest(&mut self) -> String {
        decode_line(std::mem::take(&mut self.bytes))
    }
}

fn decode_line(line: Vec<u8>) -> String {
    String::from_utf8(line).unwrap_or_else(|e| {
        warn!("invalid UTF-8 in generation stream");
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    /// `[DONE]`, or a chunk carrying a `finish_reason`.
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() {
        return SseLine::Skip;
    }
    let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseLine::Skip,
    };
    let choice = &json["choices"][0];
    let content = choice["delta"]["content"].as_str().unwrap_or_default();
    let finished = !choice["finish_reason"].is_null();
    match (content.is_empty(), finished) {
        // The final token and the finish reason may share one chunk; the
        // token is forwarded and the next line ends the stream anyway.
        (false, _) => SseLine::Token(content.to_string()),
        (true, true) => SseLine::Done,
        (true, false) => SseLine::Skip,
    }
}

/// Build the configured [`GenerationBackend`].
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn GenerationBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" | "openai" => Ok(Arc::new(ChatCompletionsBackend::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
