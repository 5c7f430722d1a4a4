use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use unveil_engine::replies::reply_to_message;
use unveil_types::api::{Claims, ReplyRequest, ReplyResponse};

use crate::error::{ApiError, blocking};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    pub limit: Option<u32>,
    /// `next_cursor` from the previous page.
    pub before: Option<String>,
}

/// The caller's own messages for an event, newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<InboxQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let reader = state.engine.reader.clone();
    let page = blocking(move || {
        reader.for_user(event_id, claims.sub, query.before.as_deref(), query.limit)
    })
    .await?;
    Ok(Json(page))
}

pub async fn reply(
    State(state): State<AppState>,
    Path((event_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state.engine.clone();
    let reply = blocking(move || {
        reply_to_message(
            &engine.db,
            engine.tracker(),
            event_id,
            message_id,
            claims.sub,
            &req.content,
        )
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(ReplyResponse {
            message_id: reply.message.id,
            warnings: reply.warnings,
        }),
    ))
}
