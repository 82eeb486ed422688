//! Generative-content API client and its stateful chat handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sse::data_events;
use super::{
    Chunk, ChunkStream, GenerativeBackend, Provider, UpstreamError, UpstreamResult, ensure_success,
};
use crate::chat::message::{Content, HistoryRole};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Sampling parameters fixed when a chat handle is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    /// `0` leaves top-k sampling to the provider and is not sent.
    #[serde(skip_serializing_if = "is_zero")]
    pub top_k: u32,
    pub max_output_tokens: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl GenerationConfig {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 0,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmCategory {
    HarmCategoryHarassment,
    HarmCategoryHateSpeech,
    HarmCategorySexuallyExplicit,
    HarmCategoryDangerousContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    BlockMediumAndAbove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

/// The four content-safety categories, each blocking at medium probability and above.
pub fn default_safety_settings() -> Vec<SafetySetting> {
    [
        HarmCategory::HarmCategoryHarassment,
        HarmCategory::HarmCategoryHateSpeech,
        HarmCategory::HarmCategorySexuallyExplicit,
        HarmCategory::HarmCategoryDangerousContent,
    ]
    .into_iter()
    .map(|category| SafetySetting {
        category,
        threshold: HarmBlockThreshold::BlockMediumAndAbove,
    })
    .collect()
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A chat bound to one model configuration.
///
/// The model, generation config, and safety settings cannot change after
/// creation; switching any of them means starting a new handle from the
/// current history. Each handle gets a process-unique id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatHandle {
    id: u64,
    model: String,
    generation: GenerationConfig,
    safety: Vec<SafetySetting>,
    history: Vec<Content>,
}

impl ChatHandle {
    pub fn start(model: impl Into<String>, generation: GenerationConfig, history: Vec<Content>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            model: model.into(),
            generation,
            safety: default_safety_settings(),
            history,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn safety(&self) -> &[SafetySetting] {
        &self.safety
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Returns `true` if this handle was created for exactly this configuration.
    pub fn is_bound_to(&self, model: &str, generation: &GenerationConfig) -> bool {
        self.model == model && &self.generation == generation
    }

    /// Appends a completed exchange to the handle's history.
    pub fn record_exchange(&mut self, prompt: &str, reply: &str) {
        self.history.push(Content::text(HistoryRole::User, prompt));
        self.history.push(Content::text(HistoryRole::Model, reply));
    }

    /// History followed by the new user utterance.
    fn contents_with(&self, prompt: &str) -> Vec<Content> {
        let mut contents = self.history.clone();
        contents.push(Content::text(HistoryRole::User, prompt));
        contents
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content>,
    generation_config: &'a GenerationConfig,
    safety_settings: &'a [SafetySetting],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Converts one event payload into a [`Chunk`].
///
/// A blocked prompt or a candidate stopped by the safety filters without any
/// text is an error rather than an empty chunk.
fn parse_event(data: &str) -> UpstreamResult<Chunk> {
    let response: GenerateContentResponse = serde_json::from_str(data)
        .map_err(|e| UpstreamError::MalformedStream(format!("bad content chunk: {e}")))?;

    let Some(candidate) = response.candidates.into_iter().next() else {
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(UpstreamError::MalformedStream(format!("prompt blocked: {reason}")));
        }
        return Ok(Chunk::empty());
    };

    let text: String = candidate
        .content
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(UpstreamError::MalformedStream(
                "response blocked by safety filters".to_string(),
            ));
        }
        return Ok(Chunk::empty());
    }
    Ok(Chunk::text(text))
}

/// Client for `POST {base}/models/{model}:streamGenerateContent?alt=sse`.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeminiClient {
    /// Builds a client. A missing `api_key` is only reported when a call is made.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url)
    }

    async fn open(&self, chat: &ChatHandle, text: &str) -> UpstreamResult<ChunkStream> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::missing_credential(Provider::Gemini))?;

        debug!(
            model = %chat.model(),
            handle = chat.id(),
            history_len = chat.history().len(),
            "opening generative-content stream"
        );

        let body = GenerateContentRequest {
            contents: chat.contents_with(text),
            generation_config: chat.generation(),
            safety_settings: chat.safety(),
        };

        let response = self
            .http
            .post(self.endpoint(chat.model()))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let chunks = data_events(response.bytes_stream())
            .map(|event| event.and_then(|data| parse_event(&data)));
        Ok(chunks.boxed())
    }
}

impl GenerativeBackend for GeminiClient {
    fn send_message<'a>(
        &'a self,
        chat: &'a ChatHandle,
        text: &'a str,
    ) -> BoxFuture<'a, UpstreamResult<ChunkStream>> {
        Box::pin(self.open(chat, text))
    }
}
