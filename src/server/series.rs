// src/server/series.rs
//
// GET /v1/series - historical time-bucketed rollups for a device.
//
// The frame parameter picks both the source aggregate view and the time
// window (day -> hourly since midnight, month -> daily since the 1st,
// year -> monthly since Jan 1, all -> monthly unbounded). Buckets come
// back ascending; an empty series is a valid result.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{authenticate, error_response, AppState};
use crate::server::store::{frame_config, BucketRow};

#[derive(Deserialize)]
pub struct SeriesQuery {
    device_id: String,
    frame: String,
}

#[derive(Serialize)]
struct SeriesResponse {
    device_id: String,
    frame: String,
    series: Vec<BucketRow>,
}

pub async fn series(
    State(state): State<AppState>,
    Query(query): Query<SeriesQuery>,
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

    if frame_config(&query.frame).is_none() {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "Invalid frame '{}'. Must be one of: all, day, month, year.",
                query.frame
            ),
        );
    }

    let series = match state.store.series(&query.device_id, &query.frame).await {
        Ok(rows) => rows,
        Err(e) => {
            tlog!(
                "[series] Query failed for device {} frame {}: {}",
                query.device_id,
                query.frame,
                e
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query series.");
        }
    };

    Json(SeriesResponse {
        device_id: query.device_id,
        frame: query.frame,
        series,
    })
    .into_response()
}
