// src/server/ingest.rs
//
// POST /v1/ingest - authenticated idempotent batch ingestion.
//
// The validation pipeline runs in a fixed order so behavior stays
// predictable under adversarial input: auth, Content-Length pre-checks,
// body size, JSON decode, empty fast path, batch cap, ownership, insert,
// cache invalidation.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{authenticate, error_response, AppState};
use crate::sample::Sample;

#[derive(Deserialize)]
struct IngestPayload {
    samples: Vec<Sample>,
}

#[derive(Serialize)]
struct IngestResponse {
    inserted: u64,
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // 1. Authenticate
    let auth_device_id = match authenticate(&state, &headers) {
        Ok(device_id) => device_id,
        Err(response) => return response,
    };

    let max_request_bytes = state.config.max_request_bytes;

    // 2. Content-Length pre-checks (cheap rejection before looking at the body)
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let length = match value.to_str().ok().and_then(|v| v.parse::<usize>().ok()) {
            Some(length) => length,
            None => {
                return error_response(StatusCode::BAD_REQUEST, "Invalid Content-Length header.")
            }
        };
        if length > max_request_bytes {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Request body exceeds limit of {} bytes.", max_request_bytes),
            );
        }
    }

    // 3. Actual body size
    if body.len() > max_request_bytes {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Request body exceeds limit of {} bytes.", max_request_bytes),
        );
    }

    // 4. Decode
    let payload: IngestPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return decode_error_response(&e),
    };

    // 5. Empty batch fast path - a valid request with no side effects
    if payload.samples.is_empty() {
        return Json(IngestResponse { inserted: 0 }).into_response();
    }

    // 6. Batch size cap
    let max_samples = state.config.max_samples_per_request;
    if payload.samples.len() > max_samples {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Batch size {} exceeds limit of {}. Split into smaller batches.",
                payload.samples.len(),
                max_samples
            ),
        );
    }

    // 7. Ownership: every sample must belong to the authenticated device
    for sample in &payload.samples {
        if sample.device_id != auth_device_id {
            return error_response(
                StatusCode::FORBIDDEN,
                format!(
                    "Sample device_id '{}' does not match authenticated device_id '{}'.",
                    sample.device_id, auth_device_id
                ),
            );
        }
    }

    // 8. Idempotent bulk insert
    let inserted = match state.store.insert_samples(&payload.samples).await {
        Ok(inserted) => inserted,
        Err(e) => {
            tlog!("[ingest] Insert failed for device {}: {}", auth_device_id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store samples.");
        }
    };

    tlog!(
        "[ingest] Ingested {}/{} sample(s) for device {}",
        inserted,
        payload.samples.len(),
        auth_device_id
    );

    // 9. Invalidate the realtime cache (best-effort, never affects the response)
    if inserted > 0 {
        state.cache.invalidate_device(&auth_device_id).await;
    }

    // 10. Done
    Json(IngestResponse { inserted }).into_response()
}

/// 422 with a machine-readable detail list locating the decode failure.
fn decode_error_response(e: &serde_json::Error) -> Response {
    let detail = serde_json::json!([{
        "msg": e.to_string(),
        "line": e.line(),
        "column": e.column(),
    }]);
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "detail": detail })),
    )
        .into_response()
}
