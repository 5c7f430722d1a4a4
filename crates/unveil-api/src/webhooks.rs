use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
use tracing::{debug, warn};

use unveil_engine::StatusUpdate;
use unveil_engine::signature::{self, SIGNATURE_HEADER};
use unveil_types::api::DeliveryStatusCallback;

use crate::error::{ApiError, blocking};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    /// False when the report would have moved the status backwards.
    pub applied: bool,
}

/// Provider status callback. The raw body is authenticated before it is
/// parsed.
pub async fn delivery_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let secret = state
        .webhook_secret
        .as_deref()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !signature::verify(secret.as_bytes(), &body, provided) {
        warn!("Rejected delivery callback with a bad signature");
        return Err(StatusCode::UNAUTHORIZED.into());
    }

    let callback: DeliveryStatusCallback = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid callback body: {e}")))?;

    let tracker = state.engine.tracker().clone();
    let channel = callback.channel;
    let provider_id = callback.provider_message_id.clone();
    let update = blocking(move || {
        tracker.record_status_by_provider_id(channel, &callback.provider_message_id, callback.status)
    })
    .await?;

    debug!("Callback for {} on provider id {}: {:?}", channel, provider_id, update);
    Ok(Json(CallbackResponse {
        applied: update == StatusUpdate::Applied,
    }))
}
