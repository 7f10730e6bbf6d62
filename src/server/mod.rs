//! HTTP cache server backed by the local SQLite store.

mod handlers;

use crate::cache::SqliteCacheStore;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Shared server state
pub struct ServerState {
    pub store: SqliteCacheStore,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/mutest/:hash", get(handlers::get_entry))
        .route("/api/mutest/:hash/store", post(handlers::store_entry))
        .route("/api/status", get(handlers::api_status))
        .with_state(state)
}

/// Start the cache server
pub async fn start_server(state: Arc<ServerState>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Cache server listening on http://{}/api/mutest", addr);

    axum::serve(listener, router(state)).await?;

    Ok(())
}
