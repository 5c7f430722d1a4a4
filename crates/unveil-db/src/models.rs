//! Database row types. These map directly to SQLite rows and are parsed
//! into the `unveil-types` domain model before leaving this crate.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use uuid::Uuid;

use unveil_types::{
    ChannelSet, ChannelState, ChannelStatuses, Delivery, Event, Guest, Message, MessageType,
    RsvpStatus, ScheduledMessage, TargetSelector, User,
};

use crate::convert::{count, parse_id, parse_opt_id, parse_opt_ts, parse_ts};

pub(crate) const USER_COLUMNS: &str = "id, full_name, phone, created_at";

pub struct UserRow {
    pub id: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub created_at: String,
}

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            full_name: row.get(1)?,
            phone: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_id(&self.id)?,
            full_name: self.full_name,
            phone: self.phone,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub(crate) const EVENT_COLUMNS: &str = "id, title, host_user_id, sms_tag, created_at";

pub struct EventRow {
    pub id: String,
    pub title: String,
    pub host_user_id: String,
    pub sms_tag: Option<String>,
    pub created_at: String,
}

impl EventRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            host_user_id: row.get(2)?,
            sms_tag: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    pub fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: parse_id(&self.id)?,
            title: self.title,
            host_user_id: parse_id(&self.host_user_id)?,
            sms_tag: self.sms_tag,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub(crate) const GUEST_COLUMNS: &str = "id, event_id, user_id, guest_name, display_name, phone, email, \
     sms_opt_out, rsvp_status, declined_at, removed_at, tags, first_contact_at, created_at";

pub struct GuestRow {
    pub id: String,
    pub event_id: String,
    pub user_id: Option<String>,
    pub guest_name: Option<String>,
    pub display_name: String,
    pub phone: String,
    pub email: Option<String>,
    pub sms_opt_out: bool,
    pub rsvp_status: String,
    pub declined_at: Option<String>,
    pub removed_at: Option<String>,
    pub tags: String,
    pub first_contact_at: Option<String>,
    pub created_at: String,
}

impl GuestRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            user_id: row.get(2)?,
            guest_name: row.get(3)?,
            display_name: row.get(4)?,
            phone: row.get(5)?,
            email: row.get(6)?,
            sms_opt_out: row.get(7)?,
            rsvp_status: row.get(8)?,
            declined_at: row.get(9)?,
            removed_at: row.get(10)?,
            tags: row.get(11)?,
            first_contact_at: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    pub fn into_guest(self) -> Result<Guest> {
        let rsvp_status: RsvpStatus = self.rsvp_status.parse()?;
        let tags = serde_json::from_str(&self.tags)
            .with_context(|| format!("corrupt tags on guest {}", self.id))?;
        Ok(Guest {
            id: parse_id(&self.id)?,
            event_id: parse_id(&self.event_id)?,
            user_id: parse_opt_id(self.user_id.as_deref())?,
            guest_name: self.guest_name,
            display_name: self.display_name,
            phone: self.phone,
            email: self.email,
            sms_opt_out: self.sms_opt_out,
            rsvp_status,
            declined_at: parse_opt_ts(self.declined_at.as_deref())?,
            removed_at: parse_opt_ts(self.removed_at.as_deref())?,
            tags,
            first_contact_at: parse_opt_ts(self.first_contact_at.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, event_id, sender_user_id, content, message_type, \
     scheduled_message_id, delivered_count, failed_count, created_at";

pub struct MessageRow {
    pub id: String,
    pub event_id: String,
    pub sender_user_id: String,
    pub content: String,
    pub message_type: String,
    pub scheduled_message_id: Option<String>,
    pub delivered_count: i64,
    pub failed_count: i64,
    pub created_at: String,
}

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            sender_user_id: row.get(2)?,
            content: row.get(3)?,
            message_type: row.get(4)?,
            scheduled_message_id: row.get(5)?,
            delivered_count: row.get(6)?,
            failed_count: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            event_id: parse_id(&self.event_id)?,
            sender_user_id: parse_id(&self.sender_user_id)?,
            content: self.content,
            message_type: self.message_type.parse()?,
            scheduled_message_id: parse_opt_id(self.scheduled_message_id.as_deref())?,
            delivered_count: count(self.delivered_count)?,
            failed_count: count(self.failed_count)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub(crate) const DELIVERY_COLUMNS: &str = "id, message_id, guest_id, user_id, phone, \
     sms_status, sms_provider_id, push_status, push_provider_id, email_status, email_provider_id, \
     has_responded, response_message_id, created_at, updated_at";

pub struct DeliveryRow {
    pub id: String,
    pub message_id: String,
    pub guest_id: String,
    pub user_id: Option<String>,
    pub phone: String,
    pub sms_status: String,
    pub sms_provider_id: Option<String>,
    pub push_status: String,
    pub push_provider_id: Option<String>,
    pub email_status: String,
    pub email_provider_id: Option<String>,
    pub has_responded: bool,
    pub response_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DeliveryRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_id: row.get(1)?,
            guest_id: row.get(2)?,
            user_id: row.get(3)?,
            phone: row.get(4)?,
            sms_status: row.get(5)?,
            sms_provider_id: row.get(6)?,
            push_status: row.get(7)?,
            push_provider_id: row.get(8)?,
            email_status: row.get(9)?,
            email_provider_id: row.get(10)?,
            has_responded: row.get(11)?,
            response_message_id: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    pub fn into_delivery(self) -> Result<Delivery> {
        Ok(Delivery {
            id: parse_id(&self.id)?,
            message_id: parse_id(&self.message_id)?,
            guest_id: parse_id(&self.guest_id)?,
            user_id: parse_opt_id(self.user_id.as_deref())?,
            phone: self.phone,
            sms: ChannelState {
                status: self.sms_status.parse()?,
                provider_message_id: self.sms_provider_id,
            },
            push: ChannelState {
                status: self.push_status.parse()?,
                provider_message_id: self.push_provider_id,
            },
            email: ChannelState {
                status: self.email_status.parse()?,
                provider_message_id: self.email_provider_id,
            },
            has_responded: self.has_responded,
            response_message_id: parse_opt_id(self.response_message_id.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

pub(crate) const SCHEDULED_COLUMNS: &str = "id, event_id, sender_user_id, content, message_type, \
     target_kind, target_guest_ids, target_tags, require_all_tags, target_rsvp_statuses, include_declined, \
     send_via_sms, send_via_push, send_via_email, send_at, recipient_count, status, created_at, \
     claimed_at, processed_at, failure_reason, message_id, success_count, failure_count";

pub struct ScheduledMessageRow {
    pub id: String,
    pub event_id: String,
    pub sender_user_id: String,
    pub content: String,
    pub message_type: String,
    pub target_kind: String,
    pub target_guest_ids: Option<String>,
    pub target_tags: Option<String>,
    pub require_all_tags: bool,
    pub target_rsvp_statuses: Option<String>,
    pub include_declined: bool,
    pub send_via_sms: bool,
    pub send_via_push: bool,
    pub send_via_email: bool,
    pub send_at: String,
    pub recipient_count: i64,
    pub status: String,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub processed_at: Option<String>,
    pub failure_reason: Option<String>,
    pub message_id: Option<String>,
    pub success_count: i64,
    pub failure_count: i64,
}

impl ScheduledMessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_id: row.get(1)?,
            sender_user_id: row.get(2)?,
            content: row.get(3)?,
            message_type: row.get(4)?,
            target_kind: row.get(5)?,
            target_guest_ids: row.get(6)?,
            target_tags: row.get(7)?,
            require_all_tags: row.get(8)?,
            target_rsvp_statuses: row.get(9)?,
            include_declined: row.get(10)?,
            send_via_sms: row.get(11)?,
            send_via_push: row.get(12)?,
            send_via_email: row.get(13)?,
            send_at: row.get(14)?,
            recipient_count: row.get(15)?,
            status: row.get(16)?,
            created_at: row.get(17)?,
            claimed_at: row.get(18)?,
            processed_at: row.get(19)?,
            failure_reason: row.get(20)?,
            message_id: row.get(21)?,
            success_count: row.get(22)?,
            failure_count: row.get(23)?,
        })
    }

    fn target(&self) -> Result<TargetSelector> {
        let selector = match self.target_kind.as_str() {
            "all_guests" => TargetSelector::AllGuests,
            "guest_ids" => TargetSelector::GuestIds {
                guest_ids: decode_list(self.target_guest_ids.as_deref(), &self.id)?,
            },
            "tags" => TargetSelector::Tags {
                tags: decode_list(self.target_tags.as_deref(), &self.id)?,
                require_all: self.require_all_tags,
            },
            "rsvp_statuses" => TargetSelector::RsvpStatuses {
                statuses: decode_list(self.target_rsvp_statuses.as_deref(), &self.id)?,
                include_declined: self.include_declined,
            },
            other => anyhow::bail!("unknown target kind {:?} on scheduled message {}", other, self.id),
        };
        Ok(selector)
    }

    pub fn into_scheduled(self) -> Result<ScheduledMessage> {
        let target = self.target()?;
        Ok(ScheduledMessage {
            id: parse_id(&self.id)?,
            event_id: parse_id(&self.event_id)?,
            sender_user_id: parse_id(&self.sender_user_id)?,
            content: self.content,
            message_type: self.message_type.parse()?,
            target,
            channels: ChannelSet {
                sms: self.send_via_sms,
                push: self.send_via_push,
                email: self.send_via_email,
            },
            send_at: parse_ts(&self.send_at)?,
            recipient_count: count(self.recipient_count)?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            claimed_at: parse_opt_ts(self.claimed_at.as_deref())?,
            processed_at: parse_opt_ts(self.processed_at.as_deref())?,
            failure_reason: self.failure_reason,
            message_id: parse_opt_id(self.message_id.as_deref())?,
            success_count: count(self.success_count)?,
            failure_count: count(self.failure_count)?,
        })
    }
}

fn decode_list<T: serde::de::DeserializeOwned>(raw: Option<&str>, owner: &str) -> Result<Vec<T>> {
    match raw {
        Some(json) => serde_json::from_str(json)
            .with_context(|| format!("corrupt target list on scheduled message {}", owner)),
        None => Ok(Vec::new()),
    }
}

/// One row of a guest's inbox: their delivery joined to its message and
/// the sender's naming sources.
pub struct InboxRow {
    pub message_id: String,
    pub content: String,
    pub message_type: String,
    pub created_at: String,
    pub sender_user_id: String,
    pub sms_status: String,
    pub push_status: String,
    pub email_status: String,
    pub sender_full_name: Option<String>,
    pub sender_guest_name: Option<String>,
}

pub struct InboxEntry {
    pub message_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub sender_user_id: Uuid,
    pub statuses: ChannelStatuses,
    pub sender_full_name: Option<String>,
    pub sender_guest_name: Option<String>,
}

impl InboxRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            content: row.get(1)?,
            message_type: row.get(2)?,
            created_at: row.get(3)?,
            sender_user_id: row.get(4)?,
            sms_status: row.get(5)?,
            push_status: row.get(6)?,
            email_status: row.get(7)?,
            sender_full_name: row.get(8)?,
            sender_guest_name: row.get(9)?,
        })
    }

    pub fn into_entry(self) -> Result<InboxEntry> {
        Ok(InboxEntry {
            message_id: parse_id(&self.message_id)?,
            content: self.content,
            message_type: self.message_type.parse()?,
            created_at: parse_ts(&self.created_at)?,
            sender_user_id: parse_id(&self.sender_user_id)?,
            statuses: ChannelStatuses {
                sms: self.sms_status.parse()?,
                push: self.push_status.parse()?,
                email: self.email_status.parse()?,
            },
            sender_full_name: self.sender_full_name,
            sender_guest_name: self.sender_guest_name,
        })
    }
}
