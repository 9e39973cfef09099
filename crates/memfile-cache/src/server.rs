//! HTTP server for cached files
//!
//! Provides /health, /files and /file/{*path}. Files are only ever served from
//! memory; a path that is not cached is a 404.

use crate::cache::MemFileCache;
use crate::types::{CacheEntry, HealthResponse};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: MemFileCache,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: MemFileCache) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files", get(list_files))
        .route("/file/{*path}", get(get_file))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache.stats(),
    })
}

/// Metadata for every cached file
async fn list_files(State(state): State<SharedState>) -> Json<Vec<CacheEntry>> {
    let mut entries = state.cache.entries();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Json(entries)
}

/// Serve a cached file's content
async fn get_file(State(state): State<SharedState>, Path(path): Path<String>) -> Response {
    // Absolute keys lose their leading slash in the route capture
    let key = [PathBuf::from(&path), PathBuf::from(format!("/{}", path))]
        .into_iter()
        .find(|candidate| state.cache.contains(candidate));

    match key.and_then(|key| state.cache.get(key)) {
        Some(entry) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, entry.content_type.clone()),
                (header::HeaderName::from_static("x-cache"), "HIT".to_string()),
            ],
            Bytes::copy_from_slice(entry.content.as_bytes()),
        )
            .into_response(),
        None => {
            debug!(path = %path, "File not cached");
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "File not cached".to_string(),
                }),
            )
                .into_response()
        }
    }
}
