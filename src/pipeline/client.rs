//! Model transport: the [`ChatModel`] seam and its hosted-endpoint client.
//!
//! The extraction capabilities never talk HTTP themselves; they build a
//! [`ChatRequest`] — a fixed instruction template identifier plus ordered
//! content parts — and hand it to a `ChatModel`. Production uses
//! [`OpenAiCompatClient`] against any OpenAI-compatible `/chat/completions`
//! endpoint (Groq by default); tests swap in scripted stubs that dispatch on
//! the instruction identifier. Keeping the seam this narrow is what makes
//! every pipeline path testable without a network.
//!
//! ## Message layout
//!
//! One user message whose content array is: the instruction template text,
//! then the caller's parts in order. Part order is load-bearing — for
//! raw extraction the image parts are poem page order.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{ModelError, PoemError};
use crate::prompts;

/// Identifier of a fixed instruction template. The client resolves it to the
/// template text; stubs match on it to decide which scripted response applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionId {
    RawExtract,
    Validate,
    Derive,
}

impl InstructionId {
    /// The fixed template text for this capability.
    pub fn template(&self) -> &'static str {
        match self {
            InstructionId::RawExtract => prompts::RAW_EXTRACT_PROMPT,
            InstructionId::Validate => prompts::VALIDATE_PROMPT,
            InstructionId::Derive => prompts::DERIVE_PROMPT,
        }
    }
}

impl std::fmt::Display for InstructionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstructionId::RawExtract => "raw-extract",
            InstructionId::Validate => "validate",
            InstructionId::Derive => "derive",
        };
        f.write_str(name)
    }
}

/// One ordered content part of a request.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    /// A `data:` URI produced by the codec's transport encoding.
    ImageUrl(String),
}

/// A single capability call: fixed instruction plus ordered content parts.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub instruction: InstructionId,
    pub parts: Vec<ContentPart>,
}

/// The one seam between the pipeline and the hosted model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Execute one model call and return the raw assistant text.
    async fn complete(&self, request: ChatRequest) -> Result<String, ModelError>;
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum WirePart<'a> {
    #[serde(rename = "text")]
    Text { text: &'a str },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: WireImageUrl<'a> },
}

#[derive(Serialize)]
struct WireImageUrl<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireAssistantMessage,
}

#[derive(Deserialize)]
struct WireAssistantMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ── Client ───────────────────────────────────────────────────────────────

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
///
/// Credentials come from [`PipelineConfig::api_key`] or, failing that, the
/// `GROQ_API_KEY` environment variable. The per-call timeout is enforced at
/// the HTTP-client level, so a hung endpoint surfaces as
/// [`ModelError::Timeout`] and follows the abort path upstream. There is no
/// transport-level retry here: each capability is a single call, and recovery
/// is the caller's retry-finalize with images preserved.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: usize,
    timeout_secs: u64,
}

impl OpenAiCompatClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, PoemError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| PoemError::Internal(format!("could not build HTTP client: {}", e)))?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("GROQ_API_KEY").ok());
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.api_timeout_secs,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut content = Vec::with_capacity(request.parts.len() + 1);
        content.push(WirePart::Text {
            text: request.instruction.template(),
        });
        for part in &request.parts {
            match part {
                ContentPart::Text(text) => content.push(WirePart::Text { text }),
                ContentPart::ImageUrl(uri) => content.push(WirePart::ImageUrl {
                    image_url: WireImageUrl { url: uri },
                }),
            }
        }
        let body = ChatCompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![WireMessage {
                role: "user",
                content,
            }],
        };

        let start = Instant::now();
        let mut outbound = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            outbound = outbound.bearer_auth(key);
        }
        let response = outbound
            .send()
            .await
            .map_err(|e| classify_send_error(e, &self.base_url, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiStatus {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }

        let payload: ChatCompletionResponse =
            response.json().await.map_err(|e| ModelError::Malformed {
                detail: format!("response body was not valid JSON: {}", e),
            })?;
        if let Some(usage) = &payload.usage {
            debug!(
                "{}: {} input tokens, {} output tokens, {:?}",
                request.instruction,
                usage.prompt_tokens,
                usage.completion_tokens,
                start.elapsed()
            );
        }

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ModelError::Malformed {
                detail: "response contained no assistant content".to_string(),
            })
    }
}

fn classify_send_error(e: reqwest::Error, endpoint: &str, timeout_secs: u64) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout { secs: timeout_secs }
    } else if e.is_connect() {
        ModelError::Unreachable {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        }
    } else {
        ModelError::Network(e.to_string())
    }
}

fn truncate(body: &str, limit: usize) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= limit {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(limit).collect();
        format!("{}…", cut)
    }
}
