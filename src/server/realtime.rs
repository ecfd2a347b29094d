// src/server/realtime.rs
//
// GET /v1/realtime - latest sample for a device, with a short-TTL cache
// in front of the store. The cache is consulted and refreshed best-effort;
// any cache failure falls through to the database.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::{authenticate, error_response, AppState};
use crate::server::cache::realtime_key;

#[derive(Deserialize)]
pub struct RealtimeQuery {
    device_id: String,
}

pub async fn realtime(
    State(state): State<AppState>,
    Query(query): Query<RealtimeQuery>,
    headers: HeaderMap,
) -> Response {
    let auth_device_id = match authenticate(&state, &headers) {
        Ok(device_id) => device_id,
        Err(response) => return response,
    };

    if query.device_id != auth_device_id {
        return error_response(
            StatusCode::FORBIDDEN,
            "Device ID does not match authenticated device.",
        );
    }

    let key = realtime_key(&query.device_id);

    // Cache hit: return the stored encoding verbatim
    if let Some(cached) = state.cache.get(&key).await {
        match serde_json::from_str::<serde_json::Value>(&cached) {
            Ok(value) => return Json(value).into_response(),
            Err(e) => {
                tlog!("[realtime] Discarding corrupt cache entry {}: {}", key, e);
            }
        }
    }

    let sample = match state.store.latest_sample(&query.device_id).await {
        Ok(Some(sample)) => sample,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("No data found for device_id '{}'.", query.device_id),
            )
        }
        Err(e) => {
            tlog!("[realtime] Store query failed for {}: {}", query.device_id, e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to query latest sample.",
            );
        }
    };

    // Refresh the cache (best-effort)
    match serde_json::to_string(&sample) {
        Ok(encoded) => state.cache.set(&key, &encoded, state.config.cache_ttl_s).await,
        Err(e) => tlog!("[realtime] Failed to encode sample for cache: {}", e),
    }

    Json(sample).into_response()
}
