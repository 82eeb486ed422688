//! Upstream LLM clients with streamed replies.
//!
//! Two providers are supported, each behind its own trait so the turn
//! controller can be driven by test doubles:
//!
//! - [`CompletionBackend`] / [`OpenAiClient`]: chat-completion API. Every call
//!   carries the whole transcript.
//! - [`GenerativeBackend`] / [`GeminiClient`]: generative-content API. Calls go
//!   through a [`ChatHandle`] bound to one model configuration that carries the
//!   prior history.
//!
//! Both return a [`ChunkStream`] of incremental text fragments. Every failure is
//! reduced to one of four [`ErrorKind`]s.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::message::Message;

pub mod gemini;
pub mod openai;
pub mod sse;

pub use gemini::{ChatHandle, GeminiClient, GenerationConfig, SafetySetting};
pub use openai::OpenAiClient;

/// Which upstream API a deployment talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Chat-completion API.
    OpenAi,
    /// Generative-content API.
    Gemini,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// Models offered in the picker when none are configured.
    pub fn default_models(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["gpt-3.5-turbo", "gpt-4"],
            Self::Gemini => &["gemini-pro", "gemini-1.5-pro"],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Coarse classification of upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Auth,
    RateLimit,
    MalformedStream,
}

/// Failure of an upstream call, before or during streaming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("malformed stream: {0}")]
    MalformedStream(String),
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::Auth(_) => ErrorKind::Auth,
            Self::RateLimit(_) => ErrorKind::RateLimit,
            Self::MalformedStream(_) => ErrorKind::MalformedStream,
        }
    }

    /// Error for a call attempted without a configured API key.
    pub fn missing_credential(provider: Provider) -> Self {
        Self::Auth(format!("no API key configured for {provider}"))
    }

    /// Classifies a non-success HTTP status and its response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = provider_error_message(body).unwrap_or_else(|| body.trim().to_owned());
        let message = format!("upstream returned {status}: {detail}");
        match status {
            401 | 403 => Self::Auth(message),
            429 => Self::RateLimit(message),
            _ => Self::Network(message),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedStream(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Extracts `error.message` from the JSON error envelope both providers use.
fn provider_error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Envelope {
        error: Detail,
    }
    #[derive(Deserialize)]
    struct Detail {
        message: String,
    }

    serde_json::from_str::<Envelope>(body)
        .ok()
        .map(|envelope| envelope.error.message)
}

/// Returns `response` unchanged when its status is 2xx, otherwise reads the body
/// and converts it into an [`UpstreamError`].
pub(crate) async fn ensure_success(response: reqwest::Response) -> UpstreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "failed to read error response".to_string());
    Err(UpstreamError::from_status(status.as_u16(), &body))
}

/// One incremental unit of a streamed reply. A chunk without text is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub text: Option<String>,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// A streamed reply. Ends after the last chunk or after the first error.
pub type ChunkStream = BoxStream<'static, UpstreamResult<Chunk>>;

/// Chat-completion style upstream: stateless, receives the entire transcript.
pub trait CompletionBackend: Send + Sync {
    fn stream_chat<'a>(
        &'a self,
        model: &'a str,
        messages: &'a [Message],
    ) -> BoxFuture<'a, UpstreamResult<ChunkStream>>;
}

/// Generative-content style upstream: receives the latest utterance plus the
/// history and configuration carried by a [`ChatHandle`].
pub trait GenerativeBackend: Send + Sync {
    fn send_message<'a>(
        &'a self,
        chat: &'a ChatHandle,
        text: &'a str,
    ) -> BoxFuture<'a, UpstreamResult<ChunkStream>>;
}

/// The upstream a deployment is wired to.
#[derive(Clone)]
pub enum Upstream {
    Completion(Arc<dyn CompletionBackend>),
    Generative(Arc<dyn GenerativeBackend>),
}

impl Upstream {
    pub fn provider(&self) -> Provider {
        match self {
            Self::Completion(_) => Provider::OpenAi,
            Self::Generative(_) => Provider::Gemini,
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Upstream").field(&self.provider()).finish()
    }
}
