//! Chat completion with retrieval augmentation.
//!
//! [`ChatClient`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint (OpenAI, Ollama, LM Studio), either waiting for the whole
//! answer or streaming server-sent deltas. [`HelpChat`] puts a
//! [`Retriever`] in front of it: the prompt is prefixed with the most
//! similar indexed documents before it is sent.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::retrieve::Retriever;

pub const SYSTEM_PROMPT: &str = "You are a knowledgeable assistant that provides comprehensive, detailed, and accurate answers. \
Use the provided context from the documentation to answer questions thoroughly. \
When relevant information is available in the context, cite it and explain it clearly. \
Provide complete explanations with examples when appropriate. \
If the context doesn't contain enough information, acknowledge what you know and what you don't know.";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Failed to connect to API endpoint '{endpoint}'. Please verify the endpoint is correct and accessible. Error: {message}")]
    ConnectionFailure { endpoint: String, message: String },

    #[error("Request to API endpoint '{endpoint}' timed out. The server may be overloaded or unreachable. Error: {message}")]
    RequestTimeout { endpoint: String, message: String },

    #[error("API request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid response from API: {0}")]
    InvalidResponse(String),
}

/// Pick the chat model: an explicit name wins, otherwise guess from the
/// endpoint URL.
pub fn resolve_model_name(model_name: &str, api_path: &str) -> String {
    if !model_name.is_empty() {
        return model_name.to_string();
    }
    let api = api_path.to_lowercase();
    if api.contains("openai.com") {
        "gpt-4o"
    } else if api.contains("localhost:11434") || api.contains("ollama") {
        "llama3.2"
    } else if api.contains("localhost:1234") || api.contains("lmstudio") {
        "local-model"
    } else {
        "gpt-4o"
    }
    .to_string()
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub api_path: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_path: config.api_path.clone(),
            api_key: config.api_key.clone(),
            model: resolve_model_name(&config.model_name, &config.api_path),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            timeout: config.request_timeout(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

pub struct ChatClient {
    settings: ChatSettings,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(settings: ChatSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { settings, client })
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// Send `system` + `user` and wait for the whole answer.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, ChatError> {
        let response = self.send(system, user, false).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.map_error(e))?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    /// Send `system` + `user` with streaming enabled. `on_delta` receives
    /// each non-empty content fragment as it arrives; the full answer is
    /// returned at the end.
    pub async fn stream<F>(&self, system: &str, user: &str, mut on_delta: F) -> Result<String, ChatError>
    where
        F: FnMut(&str),
    {
        let mut response = self.send(system, user, true).await?;
        let mut decoder = SseDecoder::default();
        let mut answer = String::new();

        'read: while let Some(bytes) = response.chunk().await.map_err(|e| self.map_error(e))? {
            for event in decoder.push(&bytes)? {
                match event {
                    SseEvent::Delta(text) => {
                        on_delta(&text);
                        answer.push_str(&text);
                    }
                    SseEvent::Done => break 'read,
                }
            }
        }
        for event in decoder.finish()? {
            if let SseEvent::Delta(text) = event {
                on_delta(&text);
                answer.push_str(&text);
            }
        }
        Ok(answer)
    }

    async fn send(&self, system: &str, user: &str, stream: bool) -> Result<reqwest::Response, ChatError> {
        let url = format!("{}/chat/completions", self.settings.api_path.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            stream,
        };

        let api_key = if self.settings.api_key.is_empty() {
            "not-needed"
        } else {
            self.settings.api_key.as_str()
        };

        debug!("POST {} (model {}, stream {})", url, self.settings.model, stream);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::RequestFailed(format!("HTTP {}: {}", status, text)));
        }
        Ok(response)
    }

    fn map_error(&self, e: reqwest::Error) -> ChatError {
        let endpoint = self.settings.api_path.clone();
        if e.is_timeout() {
            ChatError::RequestTimeout {
                endpoint,
                message: e.to_string(),
            }
        } else if e.is_connect() {
            ChatError::ConnectionFailure {
                endpoint,
                message: e.to_string(),
            }
        } else if e.is_decode() {
            ChatError::InvalidResponse(e.to_string())
        } else {
            ChatError::RequestFailed(e.to_string())
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Splits a server-sent-events byte stream into events. Bytes are buffered
/// until a full line is available so multi-byte characters split across
/// chunks decode correctly. The `data:` lines of one event are joined with
/// `\n` and dispatched at the blank line that ends it.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, ChatError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.line(&String::from_utf8_lossy(&line))? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush a trailing line and an event the stream did not terminate.
    fn finish(&mut self) -> Result<Vec<SseEvent>, ChatError> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if let Some(event) = self.line(&String::from_utf8_lossy(&rest))? {
            events.push(event);
        }
        if let Some(event) = self.dispatch()? {
            events.push(event);
        }
        Ok(events)
    }

    fn line(&mut self, line: &str) -> Result<Option<SseEvent>, ChatError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Result<Option<SseEvent>, ChatError> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let payload = std::mem::take(&mut self.data).join("\n");
        parse_sse_payload(&payload)
    }
}

fn parse_sse_payload(payload: &str) -> Result<Option<SseEvent>, ChatError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| ChatError::InvalidResponse(format!("{}: {}", e, payload)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(SseEvent::Delta))
}

/// Retrieval-augmented chat over the indexed documents.
pub struct HelpChat {
    client: ChatClient,
    retriever: Retriever,
    context_documents: usize,
}

impl HelpChat {
    pub async fn open(config: &Config) -> Result<Self> {
        let retriever = Retriever::open(config).await?;
        let client = ChatClient::new(ChatSettings::from_config(config))?;
        Ok(Self::new(client, retriever, config.context_documents))
    }

    pub fn new(client: ChatClient, retriever: Retriever, context_documents: usize) -> Self {
        Self {
            client,
            retriever,
            context_documents,
        }
    }

    /// The prompt actually sent to the model: `prompt` prefixed with the
    /// best-matching documents.
    pub async fn build_prompt(&self, prompt: &str) -> Result<String> {
        let hits = self.retriever.retrieve(prompt, self.context_documents).await?;
        debug!("Retrieved {} context documents", hits.len());
        Ok(self.retriever.augment_prompt(prompt, &hits))
    }

    pub async fn make_request(&self, prompt: &str) -> Result<String> {
        let augmented = self.build_prompt(prompt).await?;
        Ok(self.client.complete(SYSTEM_PROMPT, &augmented).await?)
    }

    pub async fn make_request_streaming<F>(&self, prompt: &str, on_delta: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        let augmented = self.build_prompt(prompt).await?;
        Ok(self.client.stream(SYSTEM_PROMPT, &augmented, on_delta).await?)
    }

    pub async fn close(self) {
        self.retriever.close().await;
    }
}
