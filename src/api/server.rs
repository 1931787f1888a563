use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::audit::AuditLog;
use crate::config::TracelineConfig;
use crate::governor::Governor;
use crate::lifecycle::LifecycleEngine;
use crate::registry::IdentityRegistry;
use crate::store::{CoreDb, DbHandle, HotCache};
use crate::telemetry::Telemetry;

use super::{AppState, SharedState, api_router, ws};

/// Wire all components onto one database handle and event channel.
pub fn build_state(db: DbHandle, config: &TracelineConfig) -> SharedState {
    let cache = Arc::new(HotCache::new(Duration::from_secs(
        config.storage.cache_ttl_secs,
    )));
    let (events_tx, _rx) = broadcast::channel::<String>(config.audit.broadcast_capacity);

    Arc::new(AppState {
        registry: Arc::new(IdentityRegistry::new(db.clone(), cache.clone())),
        lifecycle: Arc::new(LifecycleEngine::new(db.clone(), cache)),
        audit: Arc::new(AuditLog::new(
            db.clone(),
            events_tx.clone(),
            config.audit.error_window_secs,
        )),
        telemetry: Arc::new(Telemetry::new(db.clone())),
        governor: Arc::new(Governor::new(config.governor_rules(), db)),
        events_tx,
    })
}

/// Build the full application router with API and event-stream routes.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the traceline server.
pub async fn start_server(config: TracelineConfig) -> Result<()> {
    if let Some(parent) = config.storage.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = CoreDb::new(&config.storage.db_path).context("Failed to initialize core database")?;
    let state = build_state(DbHandle::new(db), &config);

    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "traceline core listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}
