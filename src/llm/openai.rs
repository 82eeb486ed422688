//! Chat-completion API client.

use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sse::data_events;
use super::{
    Chunk, ChunkStream, CompletionBackend, Provider, UpstreamError, UpstreamResult, ensure_success,
};
use crate::chat::message::Message;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Sentinel payload closing a chat-completion stream.
const DONE: &str = "[DONE]";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

/// Converts one event payload into a [`Chunk`].
fn parse_event(data: &str) -> UpstreamResult<Chunk> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| UpstreamError::MalformedStream(format!("bad completion chunk: {e}")))?;
    if let Some(error) = chunk.error {
        return Err(UpstreamError::Network(error.message));
    }
    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content);
    Ok(Chunk { text })
}

/// Client for `POST {base}/chat/completions` with `stream: true`.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
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

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn open(&self, model: &str, messages: &[Message]) -> UpstreamResult<ChunkStream> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::missing_credential(Provider::OpenAi))?;

        debug!(
            model = %model,
            message_count = messages.len(),
            "opening chat-completion stream"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&ChatCompletionRequest {
                model,
                messages,
                stream: true,
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let chunks = data_events(response.bytes_stream())
            .take_while(|event| future::ready(!matches!(event, Ok(data) if data.trim() == DONE)))
            .map(|event| event.and_then(|data| parse_event(&data)));
        Ok(chunks.boxed())
    }
}

impl CompletionBackend for OpenAiClient {
    fn stream_chat<'a>(
        &'a self,
        model: &'a str,
        messages: &'a [Message],
    ) -> BoxFuture<'a, UpstreamResult<ChunkStream>> {
        Box::pin(self.open(model, messages))
    }
}
