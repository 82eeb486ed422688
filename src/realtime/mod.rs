//! Real-time delivery to the browser over Server-Sent Events.
//!
//! A turn's progress is pushed to the chat page as a `text/event-stream`
//! response. Each [`TurnEvent`] becomes one named SSE event whose data is the
//! event serialized as JSON.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::chat::TurnEvent;

/// Content type of an event stream response.
pub const EVENT_STREAM: &str = "text/event-stream";

/// One Server-Sent Event.
///
/// # Examples
///
/// ```
/// use cotbot::realtime::SseEvent;
///
/// let event = SseEvent::new("two\nlines").with_event("delta");
/// assert_eq!(event.encode(), "event: delta\ndata: two\ndata: lines\n\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    event: Option<String>,
    data: String,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Serializes the event in wire format. Each line of `data` gets its own
    /// `data:` field; a blank line terminates the event.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.encode())
    }
}

impl From<&TurnEvent> for SseEvent {
    fn from(event: &TurnEvent) -> Self {
        let data = serde_json::to_string(event).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize turn event");
            String::from("{}")
        });
        SseEvent::new(data).with_event(event.name())
    }
}

/// Forwards turn events as encoded SSE frames until either side goes away.
///
/// Returns the receiver that feeds a streamed response body.
pub fn forward_turn_events(mut events: mpsc::Receiver<TurnEvent>, buffer: usize) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(SseEvent::from(&event).into_bytes()).await.is_err() {
                tracing::debug!("event stream listener went away");
                break;
            }
        }
    });
    rx
}
