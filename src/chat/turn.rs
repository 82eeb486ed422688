//! Turn Controller.
//!
//! Drives one pending turn of a session through `Pending → Streaming → Idle`:
//! claims the turn, calls the upstream with the session's context, accumulates
//! the streamed chunks while reporting progress as [`TurnEvent`]s, and finally
//! writes the reply into the transcript. The session lock is only held while
//! claiming and finalizing, never across the upstream stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::message::Message;
use super::session::{SessionHandle, TurnPhase};
use crate::llm::{
    ChatHandle, Chunk, CompletionBackend, ErrorKind, GenerativeBackend, Upstream, UpstreamError,
    UpstreamResult,
};

/// Appended to the visible text while a reply is still streaming.
pub const CURSOR: char = '▌';

/// Concatenates the text of streamed chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyAccumulator {
    text: String,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the chunk's text. Returns `false` for chunks without text.
    pub fn push(&mut self, chunk: &Chunk) -> bool {
        match chunk.text.as_deref() {
            Some(text) if !text.is_empty() => {
                self.text.push_str(text);
                true
            }
            _ => false,
        }
    }

    /// The in-progress text followed by the cursor glyph.
    pub fn display(&self) -> String {
        format!("{}{CURSOR}", self.text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Progress of a turn, as shown to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Started { model: String },
    /// The placeholder text: everything received so far plus [`CURSOR`].
    Delta { display: String },
    /// Final reply, now part of the transcript.
    Completed { content: String },
    Failed { kind: ErrorKind, message: String },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Delta { .. } => "delta",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Why a turn could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("no turn is pending")]
    NothingPending,

    #[error("the pending turn is already streaming")]
    AlreadyStreaming,
}

/// How a turn that did run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(String),
    Failed(UpstreamError),
}

/// A claimed turn, detached from the session lock.
enum TurnRequest {
    Completion {
        backend: Arc<dyn CompletionBackend>,
        model: String,
        messages: Vec<Message>,
    },
    Generative {
        backend: Arc<dyn GenerativeBackend>,
        chat: ChatHandle,
    },
}

struct ClaimedTurn {
    prompt: String,
    model: String,
    request: TurnRequest,
}

/// Runs pending turns against the configured upstream.
#[derive(Debug, Clone)]
pub struct TurnController {
    upstream: Upstream,
    chunk_delay: Duration,
}

impl TurnController {
    /// `chunk_delay` is slept after every displayed delta. It only paces the
    /// typing effect.
    pub fn new(upstream: Upstream, chunk_delay: Duration) -> Self {
        Self {
            upstream,
            chunk_delay,
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Runs the session's pending turn to completion, reporting progress on
    /// `events`. A closed `events` channel does not stop the turn.
    ///
    /// # Errors
    ///
    /// [`TurnError::NothingPending`] when the session is idle and
    /// [`TurnError::AlreadyStreaming`] when another run owns the turn.
    pub async fn run_pending(
        &self,
        session: &SessionHandle,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome, TurnError> {
        let turn = self.claim(session).await?;
        Ok(self.drive(session, turn, events).await)
    }

    /// Claims the pending turn and runs it on its own task, so a dropped
    /// receiver (a browser that went away) does not cancel the upstream call.
    pub async fn spawn(
        &self,
        session: SessionHandle,
        buffer: usize,
    ) -> Result<mpsc::Receiver<TurnEvent>, TurnError> {
        let turn = self.claim(&session).await?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let controller = self.clone();
        tokio::spawn(async move {
            controller.drive(&session, turn, tx).await;
        });
        Ok(rx)
    }

    async fn claim(&self, session: &SessionHandle) -> Result<ClaimedTurn, TurnError> {
        let mut state = session.lock().await;
        match state.phase() {
            TurnPhase::Idle => return Err(TurnError::NothingPending),
            TurnPhase::Streaming => return Err(TurnError::AlreadyStreaming),
            TurnPhase::Pending => {}
        }

        let Some(prompt) = state.latest_prompt().map(str::to_owned) else {
            state.abandon_turn();
            return Err(TurnError::NothingPending);
        };
        let model = state.model().to_owned();

        let request = match &self.upstream {
            Upstream::Completion(backend) => TurnRequest::Completion {
                backend: Arc::clone(backend),
                model: model.clone(),
                messages: state.messages().to_vec(),
            },
            Upstream::Generative(backend) => TurnRequest::Generative {
                backend: Arc::clone(backend),
                chat: state.bound_chat_handle(),
            },
        };

        state.begin_streaming();
        Ok(ClaimedTurn {
            prompt,
            model,
            request,
        })
    }

    async fn drive(
        &self,
        session: &SessionHandle,
        turn: ClaimedTurn,
        events: mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        let _ = events
            .send(TurnEvent::Started {
                model: turn.model.clone(),
            })
            .await;

        let result = self.stream_reply(&turn.request, &turn.prompt, &events).await;

        let mut state = session.lock().await;
        match result {
            Ok(reply) => {
                state.complete_turn(&turn.prompt, reply.clone());
                drop(state);
                info!(
                    session = %session.id(),
                    model = %turn.model,
                    reply_len = reply.len(),
                    "turn completed"
                );
                let _ = events
                    .send(TurnEvent::Completed {
                        content: reply.clone(),
                    })
                    .await;
                TurnOutcome::Completed(reply)
            }
            Err(err) => {
                state.abandon_turn();
                drop(state);
                warn!(
                    session = %session.id(),
                    model = %turn.model,
                    kind = ?err.kind(),
                    error = %err,
                    "turn failed"
                );
                let _ = events
                    .send(TurnEvent::Failed {
                        kind: err.kind(),
                        message: format!("Error: {err}"),
                    })
                    .await;
                TurnOutcome::Failed(err)
            }
        }
    }

    async fn stream_reply(
        &self,
        request: &TurnRequest,
        prompt: &str,
        events: &mpsc::Sender<TurnEvent>,
    ) -> UpstreamResult<String> {
        let mut chunks = match request {
            TurnRequest::Completion {
                backend,
                model,
                messages,
            } => backend.stream_chat(model, messages).await?,
            TurnRequest::Generative { backend, chat } => backend.send_message(chat, prompt).await?,
        };

        let mut reply = ReplyAccumulator::new();
        while let Some(chunk) = chunks.next().await {
            if !reply.push(&chunk?) {
                continue;
            }
            let _ = events
                .send(TurnEvent::Delta {
                    display: reply.display(),
                })
                .await;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        Ok(reply.into_text())
    }
}
