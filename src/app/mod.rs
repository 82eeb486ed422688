//! Route table of the chat service.
//!
//! | Route                 | Effect                                             |
//! |-----------------------|----------------------------------------------------|
//! | `GET /`               | chat page                                          |
//! | `GET /api/session`    | session snapshot                                   |
//! | `POST /api/messages`  | submit `{text}`; the reply is owed afterwards      |
//! | `GET /api/turn`       | run the owed reply, streamed as `text/event-stream`|
//! | `POST /api/clear`     | empty the transcript                               |
//! | `PUT /api/settings`   | change `{model?, temperature?}`                    |
//!
//! Submitting and streaming are separate requests: the page renders the user's
//! message and its "Thinking..." state first, then opens the event stream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    Response, Router, StatusCode,
    chat::{
        SessionError, SessionHandle, SessionStore, TurnController, TurnError,
        session::validate_temperature,
    },
    context::Context,
    middleware::{LoggerMiddleware, Pipeline, SessionMiddleware},
    realtime::{EVENT_STREAM, forward_turn_events},
};

const INDEX_HTML: &str = include_str!("../../assets/index.html");

/// Capacity of the per-turn event channels.
const EVENT_BUFFER: usize = 32;

/// Shared state behind every route.
#[derive(Clone)]
pub struct App {
    sessions: SessionStore,
    turns: TurnController,
}

#[derive(Debug, Deserialize)]
struct SubmitMessage {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateSettings {
    model: Option<String>,
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    Response::json(
        status,
        &ErrorBody {
            error: message.into(),
        },
    )
}

impl From<SessionError> for Response {
    fn from(err: SessionError) -> Self {
        let status = match err {
            SessionError::EmptyPrompt => StatusCode::BadRequest,
            SessionError::Busy => StatusCode::Conflict,
            SessionError::UnknownModel(_) | SessionError::TemperatureOutOfRange(_) => {
                StatusCode::UnprocessableEntity
            }
        };
        error(status, err.to_string())
    }
}

impl From<TurnError> for Response {
    fn from(err: TurnError) -> Self {
        error(StatusCode::Conflict, err.to_string())
    }
}

fn session_of(ctx: &Context) -> Result<SessionHandle, Response> {
    ctx.extensions().get::<SessionHandle>().cloned().ok_or_else(|| {
        tracing::error!("request reached a session route without a session");
        Response::new(StatusCode::InternalServerError)
    })
}

impl App {
    pub fn new(sessions: SessionStore, turns: TurnController) -> Self {
        Self { sessions, turns }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Builds the routes and wraps them in logging and session middleware.
    pub fn into_pipeline(self) -> Pipeline {
        let sessions = self.sessions.clone();
        Pipeline::new(self.router())
            .with(LoggerMiddleware)
            .with(SessionMiddleware::new(sessions))
    }

    fn router(self) -> Router {
        let app = Arc::new(self);
        let mut router = Router::new();

        router.get("/", |_ctx: Context| async { Response::html(INDEX_HTML) });

        router.get("/api/session", |ctx: Context| async move {
            match session_of(&ctx) {
                Ok(session) => Response::json(StatusCode::Ok, &session.lock().await.snapshot()),
                Err(response) => response,
            }
        });

        router.post("/api/messages", |ctx: Context| async move {
            submit(ctx).await.unwrap_or_else(|response| response)
        });

        let turn_app = Arc::clone(&app);
        router.get("/api/turn", move |ctx: Context| {
            let app = Arc::clone(&turn_app);
            async move { app.stream_turn(ctx).await.unwrap_or_else(|response| response) }
        });

        router.post("/api/clear", |ctx: Context| async move {
            clear(ctx).await.unwrap_or_else(|response| response)
        });

        router.put("/api/settings", |ctx: Context| async move {
            update_settings(ctx).await.unwrap_or_else(|response| response)
        });

        router
    }

    async fn stream_turn(&self, ctx: Context) -> Result<Response, Response> {
        let session = session_of(&ctx)?;
        let events = self.turns.spawn(session, EVENT_BUFFER).await?;
        let frames = forward_turn_events(events, EVENT_BUFFER);
        Ok(Response::stream(StatusCode::Ok, EVENT_STREAM, frames))
    }
}

async fn submit(ctx: Context) -> Result<Response, Response> {
    let session = session_of(&ctx)?;
    let body: SubmitMessage = ctx
        .json()
        .map_err(|e| error(StatusCode::BadRequest, format!("invalid message body: {e}")))?;

    let mut state = session.lock().await;
    state.submit(&body.text)?;
    Ok(Response::json(StatusCode::Accepted, &state.snapshot()))
}

async fn clear(ctx: Context) -> Result<Response, Response> {
    let session = session_of(&ctx)?;
    let mut state = session.lock().await;
    state.clear()?;
    Ok(Response::json(StatusCode::Ok, &state.snapshot()))
}

async fn update_settings(ctx: Context) -> Result<Response, Response> {
    let session = session_of(&ctx)?;
    let body: UpdateSettings = ctx
        .json()
        .map_err(|e| error(StatusCode::BadRequest, format!("invalid settings body: {e}")))?;

    // Validate everything first so a rejected request changes nothing.
    if let Some(temperature) = body.temperature {
        validate_temperature(temperature)?;
    }
    let mut state = session.lock().await;
    if let Some(model) = body.model.as_deref() {
        state.select_model(model)?;
    }
    if let Some(temperature) = body.temperature {
        state.set_temperature(temperature)?;
    }
    Ok(Response::json(StatusCode::Ok, &state.snapshot()))
}
