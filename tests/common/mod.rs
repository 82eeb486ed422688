#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cotbot::{Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// What the mock upstream saw of one request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub api_key: Option<String>,
    pub body: Value,
}

/// A canned upstream reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    status: StatusCode,
    body: String,
    /// Streams the body in pieces of this many bytes.
    split: Option<usize>,
}

impl MockReply {
    /// An event stream delivered in small chunks, so events straddle reads.
    pub fn sse(events: &[&str]) -> Self {
        let body = events
            .iter()
            .map(|data| format!("data: {data}\n\n"))
            .collect::<String>();
        Self {
            status: StatusCode::Ok,
            body,
            split: Some(7),
        }
    }

    pub fn raw(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            split: None,
        }
    }
}

pub struct MockUpstream {
    pub base_url: String,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MockUpstream {
    /// Serves `replies` in order under `prefix` (e.g. `/v1`).
    pub async fn start(prefix: &str, replies: Vec<MockReply>) -> Self {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}{prefix}", server.local_addr());
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handler_seen = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            server
                .run_until(
                    move |req: Request| {
                        handler_seen.lock().unwrap().push(SeenRequest {
                            path: req.path().to_owned(),
                            query: req.query_string().map(str::to_owned),
                            authorization: req.headers().get("authorization").map(str::to_owned),
                            api_key: req.headers().get("x-goog-api-key").map(str::to_owned),
                            body: serde_json::from_slice(req.body()).unwrap_or(Value::Null),
                        });
                        let reply = replies.lock().unwrap().pop_front();
                        async move { respond(reply) }
                    },
                    async {
                        let _ = stop_rx.await;
                    },
                )
                .await
                .unwrap();
        });

        Self {
            base_url,
            seen,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }
}

fn respond(reply: Option<MockReply>) -> Response {
    let Some(reply) = reply else {
        return Response::new(StatusCode::InternalServerError).body("no reply scripted");
    };
    match reply.split {
        Some(size) => {
            let (tx, rx) = mpsc::channel(4);
            let bytes = reply.body.into_bytes();
            tokio::spawn(async move {
                for piece in bytes.chunks(size) {
                    if tx.send(Bytes::copy_from_slice(piece)).await.is_err() {
                        break;
                    }
                }
            });
            Response::stream(reply.status, "text/event-stream", rx)
        }
        None => Response::new(reply.status)
            .header("Content-Type", "application/json")
            .body(reply.body),
    }
}

/// A chat-completion stream carrying `texts` as deltas, closed by `[DONE]`.
pub fn completion_events(texts: &[&str]) -> Vec<String> {
    let mut events = vec![r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#.to_string()];
    events.extend(texts.iter().map(|text| {
        serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]}).to_string()
    }));
    events.push(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#.to_string());
    events.push("[DONE]".to_string());
    events
}

/// A generative-content stream carrying `texts` as candidate parts.
pub fn generative_events(texts: &[&str]) -> Vec<String> {
    texts
        .iter()
        .map(|text| {
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
            })
            .to_string()
        })
        .collect()
}

pub fn as_strs(events: &[String]) -> Vec<&str> {
    events.iter().map(String::as_str).collect()
}
