//! Incremental `text/event-stream` decoding for upstream replies.
//!
//! Both providers stream their replies as Server-Sent Events. Network reads
//! split the byte stream at arbitrary points, so [`SseDecoder`] buffers partial
//! lines and only yields an event's `data` once its terminating blank line has
//! arrived.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};

use super::{UpstreamError, UpstreamResult};

/// Push-style SSE decoder that yields the `data` payload of each event.
///
/// Multiple `data:` lines of one event are joined with `\n`. Comment lines and
/// fields other than `data` are ignored.
///
/// # Examples
///
/// ```
/// use cotbot::llm::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// assert!(decoder.push(b"data: {\"a\"").unwrap().is_empty());
/// assert_eq!(decoder.push(b":1}\n\n").unwrap(), vec!["{\"a\":1}".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes, returning the payloads of every event completed by them.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::MalformedStream`] when a line is not valid UTF-8.
    pub fn push(&mut self, bytes: &[u8]) -> UpstreamResult<Vec<String>> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|e| UpstreamError::MalformedStream(format!("invalid UTF-8 in event stream: {e}")))?;
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Flushes an event left unterminated when the stream ended.
    pub fn finish(&mut self) -> UpstreamResult<Option<String>> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8(rest)
                .map_err(|e| UpstreamError::MalformedStream(format!("invalid UTF-8 in event stream: {e}")))?;
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(self.dispatch())
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_owned());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(data)
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

/// Turns a byte stream into a stream of event payloads.
///
/// The output ends after the body ends or after the first error.
pub fn data_events<S, E>(body: S) -> BoxStream<'static, UpstreamResult<String>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<UpstreamError> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(data) = st.ready.pop_front() {
                return Some((Ok(data), st));
            }
            if st.finished {
                return None;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => match st.decoder.push(&bytes) {
                    Ok(events) => st.ready.extend(events),
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e.into()), st));
                }
                None => {
                    st.finished = true;
                    match st.decoder.finish() {
                        Ok(Some(last)) => st.ready.push_back(last),
                        Ok(None) => {}
                        Err(e) => return Some((Err(e), st)),
                    }
                }
            }
        }
    })
    .boxed()
}
