// src/server/mod.rs
//
// Ingest service supervisor: config validation, dependency wiring, HTTP
// router, and lifecycle. Startup fails fast on bad configuration (bad
// DATABASE_URL, empty credential map); an unreachable cache only degrades.

pub mod auth;
pub mod cache;
pub mod ingest;
pub mod realtime;
pub mod series;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use auth::BearerAuth;
use cache::Cache;
use store::Store;

/// Shared per-process state. Everything here is populated once at startup
/// and read-only afterwards; request handlers check out pooled database
/// connections through `store`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub auth: Arc<BearerAuth>,
    pub store: Arc<Store>,
    pub cache: Cache,
}

/// Run the ingest service until a termination signal arrives.
pub async fn run(config: ServerConfig) -> Result<(), String> {
    if let Some(dir) = &config.log_dir {
        crate::logging::init_file_logging(Path::new(dir))?;
    }

    let token_map = auth::parse_device_tokens(&config.device_tokens);
    if token_map.is_empty() {
        return Err("DEVICE_TOKENS parsed but contains no valid token:device_id entries".to_string());
    }
    tlog!("[server] Parsed {} device token(s) from DEVICE_TOKENS", token_map.len());

    let store = Store::connect(&config.database_url)?;
    store.init_schema().await?;

    let cache = Cache::connect(&config.cache_url).await?;

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
        auth: Arc::new(BearerAuth::new(token_map)),
        store: Arc::new(store),
        cache,
    };

    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", bind_addr, e))?;
    tlog!("[server] Listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {}", e))?;

    tlog!("[server] Shutdown complete");
    Ok(())
}

/// Build the HTTP router. CORS is only attached when a dashboard origin
/// is configured: GET only, Authorization header permitted.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/v1/ingest", post(ingest::ingest))
        .route("/v1/realtime", get(realtime::realtime))
        .route("/v1/series", get(series::series));

    if let Some(origin) = &state.config.dashboard_origin {
        match origin.parse::<HeaderValue>() {
            Ok(origin) => {
                let cors = CorsLayer::new()
                    .allow_origin(origin)
                    .allow_methods([Method::GET])
                    .allow_headers([header::AUTHORIZATION]);
                router = router.layer(cors);
            }
            Err(e) => {
                tlog!("[server] Invalid DASHBOARD_ORIGIN, CORS disabled: {}", e);
            }
        }
    }

    router.with_state(state)
}

/// Unauthenticated liveness probe for container orchestration.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Resolve when SIGTERM or ctrl-c arrives. In-flight requests drain
/// before the server returns.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tlog!("[server] Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tlog!("[server] Received shutdown signal, draining requests");
}

// ============================================================================
// Shared Handler Helpers
// ============================================================================

/// Authenticate a request from its Authorization header, resolving to the
/// device_id bound to the presented token.
pub(crate) fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.auth.verify_header(authorization) {
        Some(device_id) => Ok(device_id.to_string()),
        None => {
            let detail = if authorization.is_none() {
                "Missing authorization credentials."
            } else {
                "Invalid or expired token."
            };
            let mut response = error_response(StatusCode::UNAUTHORIZED, detail);
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
            Err(response)
        }
    }
}

/// Uniform JSON error body: {"detail": "..."}.
pub(crate) fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "detail": detail.into() }))).into_response()
}
