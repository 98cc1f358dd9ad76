//! Habla · Language Tutoring Backend
//!
//! - Axum HTTP + WebSocket API for scenario-based lessons
//! - OpenAI chat + speech behind a gateway trait, with a mock for offline use
//! - Static SPA fallback (./static/index.html)
//!
//! Important env variables:
//!   PORT                 : u16 (default 3000)
//!   OPENAI_API_KEY       : enables OpenAI integration if present
//!   OPENAI_BASE_URL      : default "https://api.openai.com/v1"
//!   OPENAI_CHAT_MODEL    : default "gpt-4o-mini"
//!   OPENAI_TIMEOUT_SECS  : provider request timeout (default 30)
//!   USE_MOCK_API         : "true" forces the mock gateway
//!   MOCK_DELAY_MS        : simulated mock latency (default 1000)
//!   SESSION_IDLE_SECS    : idle HTTP sessions are evicted after this (default 1800)
//!   DATA_DIR             : completed-lesson storage (default ./data, empty disables)
//!   TUTOR_CONFIG_PATH    : path to TOML config (prompt template, personas, lessons)
//!   LOG_LEVEL            : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT           : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod config;
mod lessons;
mod store;
mod prompt;
mod parser;
mod gateway;
mod audio;
mod session;
mod state;
mod protocol;
mod routes;

use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::config::Settings;
use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // A local .env is optional.
  let _ = dotenvy::dotenv();
  telemetry::init_tracing();

  let settings = Settings::from_env()?;

  // Build shared application state (lesson catalog, completion store, gateway).
  let state = Arc::new(AppState::from_settings(&settings));
  let sweeper = state.spawn_session_sweeper(Duration::from_secs(60));

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state.clone());

  let addr = settings.bind_address();
  let listener = TcpListener::bind(addr).await?;
  info!(target: "habla_backend", %addr, gateway = state.gateway.name(), "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  sweeper.abort();
  info!(target: "habla_backend", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "habla_backend", error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
}
