//! Capability checks run before any read or write query executes.

use uuid::Uuid;

use unveil_types::{Delivery, Event, Guest};

use crate::error::AccessDenied;

/// A guest may read an event's messages only while they are a current,
/// non-removed member of that event. Passing this check is necessary but
/// not sufficient: the inbox query itself only reaches messages through
/// the guest's own deliveries.
pub fn authorize_guest_read(guest: Option<&Guest>, event_id: Uuid) -> Result<&Guest, AccessDenied> {
    let guest = guest.ok_or(AccessDenied {
        reason: "not a guest of this event",
    })?;
    if guest.event_id != event_id {
        return Err(AccessDenied {
            reason: "not a guest of this event",
        });
    }
    if guest.is_removed() {
        return Err(AccessDenied {
            reason: "guest has been removed from this event",
        });
    }
    Ok(guest)
}

/// Replying requires having received the message being replied to.
pub fn authorize_reply<'a>(
    guest: &Guest,
    parent_delivery: Option<&'a Delivery>,
) -> Result<&'a Delivery, AccessDenied> {
    match parent_delivery {
        Some(delivery) if delivery.guest_id == guest.id => Ok(delivery),
        _ => Err(AccessDenied {
            reason: "message was not delivered to this guest",
        }),
    }
}

pub fn authorize_host(event: &Event, user_id: Uuid) -> Result<(), AccessDenied> {
    if event.host_user_id == user_id {
        Ok(())
    } else {
        Err(AccessDenied {
            reason: "only the event host may do this",
        })
    }
}
