//! Session State Store.
//!
//! One [`SessionState`] exists per browser session. It owns the transcript, the
//! turn phase (the pending flag), the selected model and temperature, and for
//! the generative-content provider the history mirror plus the chat handle bound
//! to the current configuration.
//!
//! [`SessionStore`] maps session ids to shared states and tears down sessions
//! that have been idle longer than a configured TTL.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::message::{Content, Message, Role, mirror_history};
use crate::llm::{ChatHandle, GenerationConfig, Provider};

/// Where a session is in the turn cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPhase {
    /// No reply is owed.
    #[default]
    Idle,
    /// A user message was accepted and its reply has not been requested yet.
    Pending,
    /// The upstream call for the pending turn is in flight.
    Streaming,
}

/// Rejected session mutations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("message text is empty")]
    EmptyPrompt,

    #[error("a reply is still outstanding")]
    Busy,

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("temperature {0} is outside [0, 1]")]
    TemperatureOutOfRange(f32),
}

/// Checks that `temperature` lies in `[0, 1]`.
pub fn validate_temperature(temperature: f32) -> Result<f32, SessionError> {
    if (0.0..=1.0).contains(&temperature) {
        Ok(temperature)
    } else {
        Err(SessionError::TemperatureOutOfRange(temperature))
    }
}

/// Settings every new session starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDefaults {
    pub provider: Provider,
    /// Models offered by the picker. The first one is selected initially.
    pub models: Vec<String>,
    pub temperature: f32,
}

impl SessionDefaults {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            models: provider
                .default_models()
                .iter()
                .map(|model| (*model).to_owned())
                .collect(),
            temperature: GenerationConfig::default().temperature,
        }
    }
}

/// The mutable record behind one browser session.
#[derive(Debug)]
pub struct SessionState {
    defaults: Arc<SessionDefaults>,
    phase: TurnPhase,
    messages: Vec<Message>,
    model: String,
    temperature: f32,
    history: Vec<Content>,
    chat: Option<ChatHandle>,
}

/// Serializable view of a session for the chat page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub provider: Provider,
    pub messages: Vec<Message>,
    pub pending: bool,
    pub phase: TurnPhase,
    pub model: String,
    pub models: Vec<String>,
    pub temperature: f32,
}

impl SessionState {
    pub fn new(defaults: Arc<SessionDefaults>) -> Self {
        let model = defaults.models.first().cloned().unwrap_or_default();
        let temperature = defaults.temperature;
        Self {
            defaults,
            phase: TurnPhase::Idle,
            messages: Vec::new(),
            model,
            temperature,
            history: Vec::new(),
            chat: None,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// The pending flag: a reply is owed or being produced.
    pub fn is_pending(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Provider-native history mirror.
    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn chat_handle(&self) -> Option<&ChatHandle> {
        self.chat.as_ref()
    }

    /// Appends a user message and marks a reply as owed.
    ///
    /// # Errors
    ///
    /// [`SessionError::EmptyPrompt`] for empty or whitespace-only text and
    /// [`SessionError::Busy`] while a previous turn is outstanding.
    pub fn submit(&mut self, text: &str) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        if self.is_pending() {
            return Err(SessionError::Busy);
        }
        self.messages.push(Message::user(text));
        self.phase = TurnPhase::Pending;
        Ok(())
    }

    /// Empties the transcript and the mirror and drops the chat handle.
    ///
    /// Clearing an empty session is a no-op. A pending turn that has not started
    /// streaming is cancelled.
    ///
    /// # Errors
    ///
    /// [`SessionError::Busy`] while a reply is streaming.
    pub fn clear(&mut self) -> Result<(), SessionError> {
        if self.phase == TurnPhase::Streaming {
            return Err(SessionError::Busy);
        }
        self.messages.clear();
        self.history.clear();
        self.chat = None;
        self.phase = TurnPhase::Idle;
        Ok(())
    }

    /// Selects one of the configured models for subsequent turns.
    pub fn select_model(&mut self, model: &str) -> Result<(), SessionError> {
        if self.phase == TurnPhase::Streaming {
            return Err(SessionError::Busy);
        }
        if !self.defaults.models.iter().any(|m| m == model) {
            return Err(SessionError::UnknownModel(model.to_owned()));
        }
        self.model = model.to_owned();
        Ok(())
    }

    pub fn set_temperature(&mut self, temperature: f32) -> Result<(), SessionError> {
        if self.phase == TurnPhase::Streaming {
            return Err(SessionError::Busy);
        }
        self.temperature = validate_temperature(temperature)?;
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            provider: self.defaults.provider,
            messages: self.messages.clone(),
            pending: self.is_pending(),
            phase: self.phase,
            model: self.model.clone(),
            models: self.defaults.models.clone(),
            temperature: self.temperature,
        }
    }

    /// Text of the most recent user message.
    pub(crate) fn latest_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub(crate) fn begin_streaming(&mut self) {
        self.phase = TurnPhase::Streaming;
    }

    /// Returns the chat handle for the selected model and temperature, starting
    /// a new one from the history mirror when the current handle was created
    /// for another configuration.
    pub(crate) fn bound_chat_handle(&mut self) -> ChatHandle {
        let generation = GenerationConfig::with_temperature(self.temperature);
        if self
            .chat
            .as_ref()
            .is_some_and(|chat| !chat.is_bound_to(&self.model, &generation))
        {
            self.chat = None;
        }
        self.chat
            .get_or_insert_with(|| {
                let chat = ChatHandle::start(self.model.clone(), generation, self.history.clone());
                debug!(
                    handle = chat.id(),
                    model = %chat.model(),
                    history_len = chat.history().len(),
                    "started chat handle"
                );
                chat
            })
            .clone()
    }

    /// Appends the assistant reply and returns to idle.
    pub(crate) fn complete_turn(&mut self, prompt: &str, reply: String) {
        if let Some(chat) = self.chat.as_mut() {
            chat.record_exchange(prompt, &reply);
        }
        self.messages.push(Message::assistant(reply));
        if self.chat.is_some() {
            self.history = mirror_history(&self.messages);
        }
        self.phase = TurnPhase::Idle;
    }

    /// Returns to idle without touching the transcript.
    pub(crate) fn abandon_turn(&mut self) {
        self.phase = TurnPhase::Idle;
    }
}

/// Opaque identifier carried in the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Shared reference to one session's state.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn new(id: SessionId, state: SessionState) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Returns `true` if the session is mid-stream or currently locked.
    fn is_busy(&self) -> bool {
        self.state
            .try_lock()
            .map_or(true, |state| state.phase() == TurnPhase::Streaming)
    }
}

struct Entry {
    session: SessionHandle,
    last_seen: Instant,
}

/// All live sessions, keyed by [`SessionId`].
#[derive(Clone)]
pub struct SessionStore {
    defaults: Arc<SessionDefaults>,
    sessions: Arc<Mutex<HashMap<SessionId, Entry>>>,
}

impl SessionStore {
    pub fn new(defaults: SessionDefaults) -> Self {
        Self {
            defaults: Arc::new(defaults),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    /// Creates an empty session.
    pub async fn create(&self) -> SessionHandle {
        let id = SessionId::new();
        let session = SessionHandle::new(id, SessionState::new(Arc::clone(&self.defaults)));
        self.sessions.lock().await.insert(
            id,
            Entry {
                session: session.clone(),
                last_seen: Instant::now(),
            },
        );
        debug!(session = %id, "session created");
        session
    }

    /// Looks up a session and marks it as recently used.
    pub async fn get(&self, id: SessionId) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(&id)?;
        entry.last_seen = Instant::now();
        Some(entry.session.clone())
    }

    pub async fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .remove(&id)
            .map(|entry| entry.session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes sessions unused for longer than `ttl`, returning how many were
    /// removed. Sessions with a reply in flight are kept.
    pub async fn purge_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            now.duration_since(entry.last_seen) <= ttl || entry.session.is_busy()
        });
        before - sessions.len()
    }

    /// Spawns a task purging idle sessions every `period` (at least 1 ms).
    pub fn spawn_reaper(&self, ttl: Duration, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.purge_idle(ttl).await;
                if removed > 0 {
                    let remaining = store.len().await;
                    info!(removed, remaining, "expired idle sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::HistoryRole;

    fn defaults(provider: Provider) -> Arc<SessionDefaults> {
        Arc::new(SessionDefaults::new(provider))
    }

    #[test]
    fn new_session_is_empty_and_idle() {
        let state = SessionState::new(defaults(Provider::OpenAi));
        assert!(state.messages().is_empty());
        assert_eq!(state.phase(), TurnPhase::Idle);
        assert_eq!(state.model(), "gpt-3.5-turbo");
        assert_eq!(state.temperature(), 0.7);
    }

    #[test]
    fn submit_appends_and_sets_pending() {
        let mut state = SessionState::new(defaults(Provider::OpenAi));
        state.submit("hello").unwrap();
        assert_eq!(state.messages(), &[Message::user("hello")]);
        assert!(state.is_pending());
        assert_eq!(state.phase(), TurnPhase::Pending);
    }

    #[test]
    fn submit_rejects_blank_text() {
        let mut state = SessionState::new(defaults(Provider::OpenAi));
        assert_eq!(state.submit(""), Err(SessionError::EmptyPrompt));
        assert_eq!(state.submit(" \n\t"), Err(SessionError::EmptyPrompt));
        assert!(state.messages().is_empty());
        assert!(!state.is_pending());
    }

    #[test]
    fn submit_while_pending_is_busy() {
        let mut state = SessionState::new(defaults(Provider::OpenAi));
        state.submit("one").unwrap();
        assert_eq!(state.submit("two"), Err(SessionError::Busy));
        assert_eq!(state.messages().len(), 1);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        state.clear().unwrap();
        state.clear().unwrap();
        assert!(state.messages().is_empty());
        assert!(state.history().is_empty());

        state.submit("hi").unwrap();
        state.clear().unwrap();
        assert!(state.messages().is_empty());
        assert!(!state.is_pending());
    }

    #[test]
    fn clear_drops_chat_handle_and_mirror() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        state.submit("hi").unwrap();
        let _ = state.bound_chat_handle();
        state.begin_streaming();
        state.complete_turn("hi", "hello".into());
        assert!(state.chat_handle().is_some());
        assert_eq!(state.history().len(), 2);

        state.clear().unwrap();
        assert!(state.chat_handle().is_none());
        assert!(state.history().is_empty());
    }

    #[test]
    fn streaming_session_rejects_changes() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        state.submit("hi").unwrap();
        state.begin_streaming();
        assert_eq!(state.clear(), Err(SessionError::Busy));
        assert_eq!(state.select_model("gemini-1.5-pro"), Err(SessionError::Busy));
        assert_eq!(state.set_temperature(0.2), Err(SessionError::Busy));
        assert_eq!(state.messages().len(), 1);
    }

    #[test]
    fn model_must_be_configured() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        state.select_model("gemini-1.5-pro").unwrap();
        assert_eq!(state.model(), "gemini-1.5-pro");
        assert_eq!(
            state.select_model("gpt-4"),
            Err(SessionError::UnknownModel("gpt-4".into()))
        );
        assert_eq!(state.model(), "gemini-1.5-pro");
    }

    #[test]
    fn temperature_bounds() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        state.set_temperature(0.0).unwrap();
        state.set_temperature(1.0).unwrap();
        assert_eq!(
            state.set_temperature(1.5),
            Err(SessionError::TemperatureOutOfRange(1.5))
        );
        assert!(state.set_temperature(f32::NAN).is_err());
        assert_eq!(state.temperature(), 1.0);
    }

    #[test]
    fn handle_is_rebuilt_only_when_configuration_changes() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        let first = state.bound_chat_handle();
        assert_eq!(state.bound_chat_handle().id(), first.id());

        state.set_temperature(0.2).unwrap();
        let second = state.bound_chat_handle();
        assert_ne!(second.id(), first.id());

        state.select_model("gemini-1.5-pro").unwrap();
        let third = state.bound_chat_handle();
        assert_ne!(third.id(), second.id());
        assert_eq!(third.model(), "gemini-1.5-pro");
    }

    #[test]
    fn rebuilt_handle_starts_from_mirror() {
        let mut state = SessionState::new(defaults(Provider::Gemini));
        state.submit("hi").unwrap();
        let _ = state.bound_chat_handle();
        state.begin_streaming();
        state.complete_turn("hi", "hello".into());

        state.select_model("gemini-1.5-pro").unwrap();
        let handle = state.bound_chat_handle();
        assert_eq!(handle.history(), state.history());
        assert_eq!(handle.history()[1].role, HistoryRole::Model);
    }

    #[test]
    fn latest_prompt_finds_last_user_message() {
        let mut state = SessionState::new(defaults(Provider::OpenAi));
        assert_eq!(state.latest_prompt(), None);
        state.submit("first").unwrap();
        state.begin_streaming();
        state.complete_turn("first", "reply".into());
        state.submit("second").unwrap();
        assert_eq!(state.latest_prompt(), Some("second"));
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut state = SessionState::new(defaults(Provider::OpenAi));
        state.submit("hi").unwrap();
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["provider"], "openai");
        assert_eq!(json["pending"], true);
        assert_eq!(json["phase"], "pending");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["models"], serde_json::json!(["gpt-3.5-turbo", "gpt-4"]));
    }

    #[test]
    fn session_id_round_trips_through_text() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[tokio::test]
    async fn store_create_get_remove() {
        let store = SessionStore::new(SessionDefaults::new(Provider::OpenAi));
        let session = store.create().await;
        assert_eq!(store.len().await, 1);
        assert!(store.get(session.id()).await.is_some());
        assert!(store.get(SessionId::new()).await.is_none());
        assert!(store.remove(session.id()).await.is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_purged() {
        let store = SessionStore::new(SessionDefaults::new(Provider::OpenAi));
        let stale = store.create().await;
        let streaming = store.create().await;
        {
            let mut state = streaming.lock().await;
            state.submit("hi").unwrap();
            state.begin_streaming();
        }

        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = store.create().await;

        let removed = store.purge_idle(Duration::from_secs(60)).await;
        assert_eq!(removed, 1);
        assert!(store.get(stale.id()).await.is_none());
        assert!(store.get(streaming.id()).await.is_some());
        assert!(store.get(fresh.id()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_sessions() {
        let store = SessionStore::new(SessionDefaults::new(Provider::OpenAi));
        store.create().await;
        let reaper = store.spawn_reaper(Duration::from_secs(10), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.is_empty().await);
        reaper.abort();
    }
}
