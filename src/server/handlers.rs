use super::ServerState;
use crate::cache::CacheEntry;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

/// Look up a cached result
pub async fn get_entry(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    match state.store.load(&hash).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!("Cache lookup for {} failed: {:#}", hash, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Store a result
pub async fn store_entry(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
    Json(entry): Json<CacheEntry>,
) -> impl IntoResponse {
    match state.store.store(&hash, &entry).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "key": hash })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    entries: Option<i64>,
    version: &'static str,
}

/// API: Get server status
pub async fn api_status(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        entries: state.store.count().await.ok(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
