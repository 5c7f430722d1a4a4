//! Guest-facing read path.
//!
//! Authorization runs first and is a capability check on the guest row;
//! the inbox query that follows is driven by the guest's own delivery rows.
//! A guest therefore sees exactly the messages that were delivered to them.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use unveil_db::{Database, InboxCursorKey, InboxEntry};
use unveil_messaging::access::authorize_guest_read;
use unveil_types::api::{GuestMessage, MessagePage};
use unveil_types::display::resolve_display_name;
use unveil_types::Guest;

use crate::error::EngineError;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Opaque continuation token: URL-safe base64 of `created_at|message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxCursor(pub InboxCursorKey);

impl InboxCursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.0.created_at.to_rfc3339(), self.0.message_id);
        B64.encode(raw)
    }

    pub fn decode(token: &str) -> Result<Self, EngineError> {
        let bad = || EngineError::invalid("malformed cursor");
        let bytes = B64.decode(token.trim()).map_err(|_| bad())?;
        let raw = String::from_utf8(bytes).map_err(|_| bad())?;
        let (at, id) = raw.split_once('|').ok_or_else(bad)?;
        let created_at = DateTime::parse_from_rfc3339(at).map_err(|_| bad())?.with_timezone(&Utc);
        let message_id = id.parse::<Uuid>().map_err(|_| bad())?;
        Ok(Self(InboxCursorKey {
            created_at,
            message_id,
        }))
    }
}

pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

#[derive(Clone)]
pub struct DeliveryGatedReader {
    db: Arc<Database>,
}

impl DeliveryGatedReader {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Inbox page for the caller's roster entry in `event_id`.
    pub fn for_user(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<MessagePage, EngineError> {
        let guest = self.db.find_guest_for_user(event_id, user_id)?;
        self.read(event_id, guest.as_ref(), cursor, limit)
    }

    pub fn list_messages_for_guest(
        &self,
        event_id: Uuid,
        guest_id: Uuid,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<MessagePage, EngineError> {
        let guest = self.db.get_guest(guest_id)?;
        self.read(event_id, guest.as_ref(), cursor, limit)
    }

    fn read(
        &self,
        event_id: Uuid,
        guest: Option<&Guest>,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<MessagePage, EngineError> {
        let guest = authorize_guest_read(guest, event_id)?;
        let before = cursor.map(InboxCursor::decode).transpose()?;
        let limit = clamp_limit(limit);

        let entries = self
            .db
            .list_inbox(guest.id, event_id, before.map(|c| c.0), limit)?;

        let next_cursor = match entries.last() {
            Some(last) if entries.len() == limit as usize => Some(
                InboxCursor(InboxCursorKey {
                    created_at: last.created_at,
                    message_id: last.message_id,
                })
                .encode(),
            ),
            _ => None,
        };

        let messages = entries
            .into_iter()
            .map(|entry| to_guest_message(entry, guest))
            .collect();

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }
}

fn to_guest_message(entry: InboxEntry, reader: &Guest) -> GuestMessage {
    GuestMessage {
        sender_name: resolve_display_name(
            entry.sender_full_name.as_deref(),
            entry.sender_guest_name.as_deref(),
        ),
        is_own_message: reader.user_id == Some(entry.sender_user_id),
        delivery_status: entry.statuses.summary(),
        message_id: entry.message_id,
        content: entry.content,
        created_at: entry.created_at,
        message_type: entry.message_type,
    }
}
