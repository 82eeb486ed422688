use std::sync::Arc;
use std::time::Duration;

use cotbot::app::App;
use cotbot::chat::{SessionStore, TurnController};
use cotbot::config::Config;
use cotbot::server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often idle sessions are looked for, at most.
const MAX_REAP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e.into());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    if config.api_key.is_none() {
        warn!(provider = %config.provider, "no API key configured; replies will fail until one is set");
    }

    let sessions = SessionStore::new(config.session_defaults());
    let reaper = sessions.spawn_reaper(config.session_ttl, config.session_ttl.min(MAX_REAP_PERIOD));
    let turns = TurnController::new(config.upstream()?, config.chunk_delay);
    let pipeline = Arc::new(App::new(sessions, turns).into_pipeline());

    info!(
        provider = %config.provider,
        models = ?config.models,
        base_url = %config.base_url,
        "starting cotbot"
    );

    let server = Server::bind(&config.addr).await?;
    server
        .run_until(
            move |req| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.handle(req).await }
            },
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            },
        )
        .await?;

    reaper.abort();
    info!("cotbot stopped");
    Ok(())
}
