//! Model gateway: chat completions and text-to-speech.
//!
//! `ModelGateway` is chosen once at startup:
//!   - `OpenAiGateway` calls the provider over HTTP (chat.completions + audio.speech).
//!   - `MockGateway` answers with canned data after a fixed delay.
//!
//! Failures are logged and returned unchanged. No retry, no backoff.
//!
//! NOTE: We never log the API key and we keep payload truncations short.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument};

use crate::config::Settings;
use crate::domain::Role;

const SPEECH_MODEL: &str = "gpt-4o-mini-tts";
const SPEECH_VOICE: &str = "shimmer";
const SPEECH_FORMAT: &str = "mp3";

pub const MOCK_AUDIO: &[u8] = b"mock audio data";

/// Provider request options merged into the request body (temperature, max_tokens, voice, ...).
pub type RequestOptions = Map<String, Value>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
  pub role: Role,
  pub content: String,
}

impl ChatMessage {
  pub fn new(role: Role, content: impl Into<String>) -> Self {
    Self { role, content: content.into() }
  }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
  #[serde(default)] pub prompt_tokens: Option<u32>,
  #[serde(default)] pub completion_tokens: Option<u32>,
  #[serde(default)] pub total_tokens: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatReply {
  pub message: ChatMessage,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub usage: Option<Usage>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
  #[error("API error: {status} {status_text}: {message}")]
  Http {
    status: u16,
    status_text: String,
    message: String,
    details: Option<Value>,
  },
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("provider returned no message")]
  EmptyReply,
}

impl GatewayError {
  /// Status to relay to our own callers.
  pub fn status_code(&self) -> u16 {
    match self {
      GatewayError::Http { status, .. } => *status,
      GatewayError::Transport(e) => e.status().map(|s| s.as_u16()).unwrap_or(500),
      GatewayError::EmptyReply => 500,
    }
  }

  pub fn details(&self) -> Option<Value> {
    match self {
      GatewayError::Http { details, .. } => details.clone(),
      _ => None,
    }
  }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
  fn name(&self) -> &'static str;

  async fn generate_chat_response(
    &self,
    messages: &[ChatMessage],
    options: &RequestOptions,
  ) -> Result<ChatReply, GatewayError>;

  async fn generate_speech(&self, text: &str, options: &RequestOptions) -> Result<Vec<u8>, GatewayError>;
}

#[derive(Clone)]
pub struct OpenAiGateway {
  pub client: reqwest::Client,
  api_key: String,
  pub base_url: String,
  pub chat_model: String,
}

impl OpenAiGateway {
  pub fn new(
    api_key: impl Into<String>,
    base_url: impl Into<String>,
    chat_model: impl Into<String>,
    timeout: Duration,
  ) -> Result<Self, GatewayError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      api_key: api_key.into(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
      chat_model: chat_model.into(),
    })
  }

  /// `None` when no API key is configured.
  pub fn from_settings(settings: &Settings) -> Option<Result<Self, GatewayError>> {
    let key = settings.openai_api_key.as_ref()?;
    Some(Self::new(key.clone(), &settings.openai_base_url, &settings.chat_model, settings.request_timeout))
  }

  async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response, GatewayError> {
    let url = format!("{}{}", self.base_url, path);
    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "habla-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(body)
      .send()
      .await?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let details = serde_json::from_str::<Value>(&body).ok();
      let message = extract_openai_error(&body).unwrap_or(body);
      return Err(GatewayError::Http {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        message,
        details,
      });
    }
    Ok(res)
  }

  async fn chat_completion(&self, body: Value) -> Result<ChatReply, GatewayError> {
    let res = self.post_json("/chat/completions", &body).await?;
    let completion: ChatCompletionResponse = res.json().await?;
    let choice = completion.choices.into_iter().next().ok_or(GatewayError::EmptyReply)?;
    Ok(ChatReply {
      message: ChatMessage {
        role: choice.message.role.unwrap_or(Role::Assistant),
        content: choice.message.content.unwrap_or_default(),
      },
      usage: completion.usage,
    })
  }

  async fn speech(&self, body: Value) -> Result<Vec<u8>, GatewayError> {
    let res = self.post_json("/audio/speech", &body).await?;
    Ok(res.bytes().await?.to_vec())
  }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
  fn name(&self) -> &'static str {
    "openai"
  }

  #[instrument(level = "info", skip(self, messages, options), fields(model = %self.chat_model, messages = messages.len()))]
  async fn generate_chat_response(
    &self,
    messages: &[ChatMessage],
    options: &RequestOptions,
  ) -> Result<ChatReply, GatewayError> {
    let mut body = Map::new();
    body.insert("model".into(), Value::String(self.chat_model.clone()));
    body.extend(options.clone());
    // history always comes from the caller, never from options
    body.insert("messages".into(), serde_json::to_value(messages).unwrap_or(Value::Array(vec![])));

    let start = Instant::now();
    let result = self.chat_completion(Value::Object(body)).await;
    let elapsed = start.elapsed();

    match &result {
      Ok(reply) => {
        if let Some(usage) = &reply.usage {
          info!(target: "gateway", ?elapsed, prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
        }
      }
      Err(e) => error!(target: "gateway", ?elapsed, error = %e, "Error generating chat response"),
    }
    result
  }

  #[instrument(level = "info", skip(self, text, options), fields(text_len = text.len()))]
  async fn generate_speech(&self, text: &str, options: &RequestOptions) -> Result<Vec<u8>, GatewayError> {
    let mut body = Map::new();
    body.insert("model".into(), Value::String(SPEECH_MODEL.into()));
    body.insert("voice".into(), Value::String(SPEECH_VOICE.into()));
    body.insert("response_format".into(), Value::String(SPEECH_FORMAT.into()));
    body.extend(options.clone());
    body.insert("input".into(), Value::String(text.to_string()));

    let result = self.speech(Value::Object(body)).await;

    match &result {
      Ok(bytes) => info!(target: "gateway", bytes = bytes.len(), "Speech generated"),
      Err(e) => error!(target: "gateway", error = %e, "Error generating speech"),
    }
    result
  }
}

/// Canned replies for development and tests.
#[derive(Clone, Debug)]
pub struct MockGateway {
  pub delay: Duration,
}

impl MockGateway {
  pub fn new(delay: Duration) -> Self {
    Self { delay }
  }

  fn canned_turn(messages: &[ChatMessage]) -> &'static str {
    if messages.iter().any(|m| m.role == Role::User) {
      r#"{"evaluation":{"score":3,"feedback":"Mock evaluation: you got the main idea."},"type":"question","text":"¿Qué te gustaría tomar?","goalCompleted":false,"translation":"What would you like to drink?"}"#
    } else {
      r#"{"type":"statement","text":"¡Hola! ¿En qué puedo ayudarte hoy?","translation":"Hello! How can I help you today?"}"#
    }
  }
}

#[async_trait]
impl ModelGateway for MockGateway {
  fn name(&self) -> &'static str {
    "mock"
  }

  async fn generate_chat_response(
    &self,
    messages: &[ChatMessage],
    _options: &RequestOptions,
  ) -> Result<ChatReply, GatewayError> {
    tokio::time::sleep(self.delay).await;
    Ok(ChatReply {
      message: ChatMessage::new(Role::Assistant, Self::canned_turn(messages)),
      usage: None,
    })
  }

  async fn generate_speech(&self, _text: &str, _options: &RequestOptions) -> Result<Vec<u8>, GatewayError> {
    tokio::time::sleep(self.delay).await;
    Ok(MOCK_AUDIO.to_vec())
  }
}

// --- Provider DTOs ---

#[derive(Deserialize)]
struct ChatCompletionResponse {
  #[serde(default)] choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp {
  #[serde(default)] role: Option<Role>,
  #[serde(default)] content: Option<String>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
