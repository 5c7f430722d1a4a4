use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use unveil_db::Database;
use unveil_messaging::access::{authorize_guest_read, authorize_reply};
use unveil_types::{ChannelSet, Message, MessageType};

use crate::error::EngineError;
use crate::pipeline::validate_content;
use crate::tracker::DeliveryTracker;

#[derive(Debug, Clone)]
pub struct Reply {
    pub message: Message,
    /// Set when the reply was stored but its own feed entry was not.
    pub warnings: Vec<String>,
}

/// A guest's reply to a message they received.
///
/// The reply is stored as a Direct message from the guest's account, with
/// an in-app-only delivery to its author so it appears in their own feed.
/// The parent delivery is then marked as responded.
pub fn reply_to_message(
    db: &Database,
    tracker: &DeliveryTracker,
    event_id: Uuid,
    parent_message_id: Uuid,
    user_id: Uuid,
    content: &str,
) -> Result<Reply, EngineError> {
    validate_content(content)?;

    let guest = db.find_guest_for_user(event_id, user_id)?;
    let guest = authorize_guest_read(guest.as_ref(), event_id)?;
    let parent_delivery = db.find_delivery(parent_message_id, guest.id)?;
    let parent_delivery = authorize_reply(guest, parent_delivery.as_ref())?;

    let reply = Message {
        id: Uuid::new_v4(),
        event_id,
        sender_user_id: user_id,
        content: content.to_string(),
        message_type: MessageType::Direct,
        scheduled_message_id: None,
        delivered_count: 0,
        failed_count: 0,
        created_at: Utc::now(),
    };
    db.insert_message(&reply)?;

    let mut warnings = Vec::new();
    if let Err(gap) = tracker.create_deliveries(&reply, &[guest], ChannelSet::default()) {
        error!("Tracking gap: {}", gap);
        warnings.push(format!(
            "reply {} was saved but will not appear in your messages yet",
            reply.id
        ));
    }
    tracker.record_message_response(parent_delivery.id, reply.id)?;

    info!("Guest {} replied to message {} with {}", guest.id, parent_message_id, reply.id);
    Ok(Reply {
        message: reply,
        warnings,
    })
}
