//! isee-voice-daemon: voice session daemon for the ISEE Tutor assistant
//!
//! Each WebSocket client drives one voice session:
//! - Explicit state machine (idle, listening, transcribing, responding, stopped)
//! - Three interaction modes: tutor, friend, hybrid
//! - Transcription and response generation delegated to pluggable backends
//!
//! Audio capture and playback live in the client; this daemon only sees
//! text and opaque audio handles.

mod backend;
mod config;
mod error;
mod events;
mod ipc;
mod lifecycle;
mod modes;
mod session;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::backend::Backends;
use crate::config::Config;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::modes::ModeRegistry;
use crate::session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "isee-voice-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    info!(
        bind_addr = %config.bind_addr,
        default_mode = %config.default_mode,
        "configuration loaded"
    );

    let registry = Arc::new(ModeRegistry::builtin());
    info!(modes = ?registry.list(), "mode registry ready");

    let backends = Backends::from_config(&config);
    let manager = SessionManager::new(registry, backends, config.session_settings())
        .context("invalid default mode")?;

    let shutdown = ShutdownSignal::new();
    let server = Server::bind(&config.bind_addr, manager.clone()).await?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "WebSocket server error");
            }
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!(sessions = manager.len().await, "shutting down...");

    server.shutdown().await;

    info!("isee-voice-daemon stopped");

    Ok(())
}
