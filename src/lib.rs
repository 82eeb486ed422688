//! # cotbot
//!
//! A browser chat front-end for hosted LLM APIs, served by a small async
//! HTTP/1.1 server. Replies are streamed from the upstream provider and pushed
//! to the page as Server-Sent Events while they are generated.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cotbot::app::App;
//! use cotbot::chat::{SessionStore, TurnController};
//! use cotbot::config::Config;
//! use cotbot::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let sessions = SessionStore::new(config.session_defaults());
//!     let turns = TurnController::new(config.upstream()?, config.chunk_delay);
//!     let pipeline = Arc::new(App::new(sessions, turns).into_pipeline());
//!
//!     let server = Server::bind(&config.addr).await?;
//!     server
//!         .run(move |req| {
//!             let pipeline = Arc::clone(&pipeline);
//!             async move { pipeline.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

// ── Wire protocol and transport ───────────────────────────────────────────────
pub mod http;
pub mod server;

// ── Request handling ─────────────────────────────────────────────────────────
pub mod context;
pub mod middleware;
pub mod realtime;
pub mod router;

// ── Chat domain ──────────────────────────────────────────────────────────────
pub mod app;
pub mod chat;
pub mod config;
pub mod llm;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
