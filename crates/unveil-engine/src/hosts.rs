//! Host-only operations that do not dispatch anything.

use uuid::Uuid;

use unveil_db::Database;
use unveil_messaging::access::authorize_host;
use unveil_messaging::resolver::resolve_filter;
use unveil_types::api::{PreviewRecipientsRequest, PreviewRecipientsResponse};
use unveil_types::{Event, Message};

use crate::error::EngineError;

/// Load the event and check that `user_id` hosts it.
pub fn require_host(db: &Database, event_id: Uuid, user_id: Uuid) -> Result<Event, EngineError> {
    let event = db.get_event(event_id)?.ok_or(EngineError::NotFound("event"))?;
    authorize_host(&event, user_id)?;
    Ok(event)
}

/// Load a message and check that `user_id` hosts its event.
pub fn require_message_host(db: &Database, message_id: Uuid, user_id: Uuid) -> Result<Message, EngineError> {
    let message = db
        .get_message(message_id)?
        .ok_or(EngineError::NotFound("message"))?;
    require_host(db, message.event_id, user_id)?;
    Ok(message)
}

/// Who a filter would reach right now. Unlike a send, an empty result is
/// a valid answer here.
pub fn preview_recipients(
    db: &Database,
    event_id: Uuid,
    req: &PreviewRecipientsRequest,
) -> Result<PreviewRecipientsResponse, EngineError> {
    let roster = db.list_event_guests(event_id)?;
    let resolved = resolve_filter(&roster, &req.filter, req.channels)?;
    Ok(PreviewRecipientsResponse {
        recipient_count: u32::try_from(resolved.len()).unwrap_or(u32::MAX),
        guest_ids: resolved.into_iter().collect(),
    })
}
