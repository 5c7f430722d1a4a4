//! Host endpoints. Every handler checks that the caller hosts the event
//! before touching anything else.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use unveil_engine::hosts::{preview_recipients, require_host, require_message_host};
use unveil_engine::{EngineError, SendRequest};
use unveil_types::api::{
    Claims, PreviewRecipientsRequest, ScheduleMessageRequest, SendMessageRequest,
};

use crate::error::{ApiError, blocking};
use crate::state::AppState;

pub async fn send_message(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.engine.db.clone();
    blocking(move || require_host(&db, event_id, claims.sub)).await?;

    let request = SendRequest::from_host(event_id, claims.sub, req).map_err(EngineError::from)?;
    let report = state.engine.pipeline.send(request).await?;
    info!(
        "Host {} sent message {} to {} recipients",
        claims.sub, report.message_id, report.recipient_count
    );

    Ok((StatusCode::CREATED, Json(report.into_response())))
}

pub async fn schedule_message(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ScheduleMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let scheduled = blocking(move || {
        require_host(&engine.db, event_id, claims.sub)?;
        engine.scheduler.schedule(event_id, claims.sub, req, Utc::now())
    })
    .await?;

    Ok((StatusCode::CREATED, Json(scheduled)))
}

pub async fn list_scheduled(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let rows = blocking(move || {
        require_host(&engine.db, event_id, claims.sub)?;
        engine.scheduler.list_for_event(event_id)
    })
    .await?;
    Ok(Json(rows))
}

pub async fn cancel_scheduled(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let cancelled = blocking(move || {
        let scheduled = engine.scheduler.get(id)?;
        require_host(&engine.db, scheduled.event_id, claims.sub)?;
        engine.scheduler.cancel(id, Utc::now())
    })
    .await?;
    Ok(Json(cancelled))
}

pub async fn preview(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PreviewRecipientsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.engine.db.clone();
    let preview = blocking(move || {
        require_host(&db, event_id, claims.sub)?;
        preview_recipients(&db, event_id, &req)
    })
    .await?;
    Ok(Json(preview))
}

pub async fn message_stats(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let stats = blocking(move || {
        require_message_host(&engine.db, message_id, claims.sub)?;
        engine.tracker().message_stats(message_id)
    })
    .await?;
    Ok(Json(stats))
}
