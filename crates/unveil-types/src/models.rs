use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored enum value did not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` over a fixed text mapping.
/// The text form is what gets persisted, so it must never change for an
/// existing variant.
macro_rules! text_enum {
    ($name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// -- Users & events --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub host_user_id: Uuid,
    /// Short routing tag shown as `[Tag]` at the top of every SMS.
    pub sms_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

// -- Guests --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsvpStatus {
    Attending,
    Declined,
    Maybe,
    Pending,
}

text_enum!(RsvpStatus, "rsvp_status" {
    Attending => "attending",
    Declined => "declined",
    Maybe => "maybe",
    Pending => "pending",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    /// Name as it arrived on the imported guest list.
    pub guest_name: Option<String>,
    /// Cached render of the guest's name. Written only through the
    /// database write paths that change its inputs.
    pub display_name: String,
    pub phone: String,
    pub email: Option<String>,
    pub sms_opt_out: bool,
    pub rsvp_status: RsvpStatus,
    pub declined_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    /// Set after the first SMS carrying the brand/STOP footer was accepted.
    pub first_contact_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Guest {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// RSVP-Lite: either the decline timestamp or the status marks a decline.
    pub fn has_declined(&self) -> bool {
        self.declined_at.is_some() || self.rsvp_status == RsvpStatus::Declined
    }

    pub fn reachable_on(&self, channel: Channel) -> bool {
        match channel {
            Channel::Sms => !self.phone.trim().is_empty(),
            Channel::Email => self.email.as_deref().is_some_and(|e| !e.trim().is_empty()),
            Channel::Push => self.user_id.is_some(),
        }
    }

    /// True if at least one of the requested channels can reach this guest.
    pub fn reachable_by(&self, channels: ChannelSet) -> bool {
        channels.iter().any(|c| self.reachable_on(c))
    }
}

// -- Channels --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Push,
    Email,
}

text_enum!(Channel, "channel" {
    Sms => "sms",
    Push => "push",
    Email => "email",
});

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Sms, Channel::Push, Channel::Email];
}

/// Independently selectable delivery channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet {
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub email: bool,
}

impl ChannelSet {
    pub fn sms_only() -> Self {
        Self {
            sms: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            sms: true,
            push: true,
            email: true,
        }
    }

    pub fn contains(&self, channel: Channel) -> bool {
        match channel {
            Channel::Sms => self.sms,
            Channel::Push => self.push,
            Channel::Email => self.email,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.sms || self.push || self.email)
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    NotApplicable,
}

text_enum!(ChannelStatus, "channel_status" {
    Pending => "pending",
    Sent => "sent",
    Delivered => "delivered",
    Failed => "failed",
    NotApplicable => "not_applicable",
});

impl ChannelStatus {
    /// `delivered`, `failed` and `not_applicable` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::NotApplicable)
    }

    pub fn is_requested(self) -> bool {
        self != Self::NotApplicable
    }

    /// Provider accepted or confirmed the message.
    pub fn is_delivered_equivalent(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }

    /// Status only moves forward: pending < sent < {delivered, failed}.
    /// Out-of-order callbacks that would move it backwards are rejected.
    pub fn can_advance_to(self, next: ChannelStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Sent | Self::Delivered | Self::Failed),
            Self::Sent => matches!(next, Self::Delivered | Self::Failed),
            Self::Delivered | Self::Failed | Self::NotApplicable => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub provider_message_id: Option<String>,
}

impl ChannelState {
    pub fn new(status: ChannelStatus) -> Self {
        Self {
            status,
            provider_message_id: None,
        }
    }
}

/// Per-channel statuses of one delivery, detached from provider ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatuses {
    pub sms: ChannelStatus,
    pub push: ChannelStatus,
    pub email: ChannelStatus,
}

impl ChannelStatuses {
    pub fn get(&self, channel: Channel) -> ChannelStatus {
        match channel {
            Channel::Sms => self.sms,
            Channel::Push => self.push,
            Channel::Email => self.email,
        }
    }
}

// -- Messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Direct,
    Announcement,
    Channel,
}

text_enum!(MessageType, "message_type" {
    Direct => "direct",
    Announcement => "announcement",
    Channel => "channel",
});

/// Message content is immutable once stored; only the counters move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub event_id: Uuid,
    pub sender_user_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub scheduled_message_id: Option<Uuid>,
    pub delivered_count: u32,
    pub failed_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub message_id: Uuid,
    pub guest_id: Uuid,
    pub user_id: Option<Uuid>,
    pub phone: String,
    pub sms: ChannelState,
    pub push: ChannelState,
    pub email: ChannelState,
    pub has_responded: bool,
    pub response_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn channel(&self, channel: Channel) -> &ChannelState {
        match channel {
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
            Channel::Email => &self.email,
        }
    }

    pub fn statuses(&self) -> ChannelStatuses {
        ChannelStatuses {
            sms: self.sms.status,
            push: self.push.status,
            email: self.email.status,
        }
    }
}

// -- Recipient selection --

/// The single criterion a send or schedule resolves against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSelector {
    AllGuests,
    GuestIds {
        guest_ids: Vec<Uuid>,
    },
    Tags {
        tags: Vec<String>,
        require_all: bool,
    },
    RsvpStatuses {
        statuses: Vec<RsvpStatus>,
        include_declined: bool,
    },
}

impl TargetSelector {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllGuests => "all_guests",
            Self::GuestIds { .. } => "guest_ids",
            Self::Tags { .. } => "tags",
            Self::RsvpStatuses { .. } => "rsvp_statuses",
        }
    }

    pub fn guest_ids(&self) -> Option<&[Uuid]> {
        match self {
            Self::GuestIds { guest_ids } => Some(guest_ids),
            _ => None,
        }
    }
}

/// Recipient filter as a host submits it. Several criteria may be present;
/// [`RecipientFilter::selector`] picks exactly one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientFilter {
    #[serde(default)]
    pub guest_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub all_guests: bool,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub require_all_tags: bool,
    #[serde(default)]
    pub rsvp_statuses: Option<Vec<RsvpStatus>>,
    #[serde(default)]
    pub include_declined: bool,
}

impl RecipientFilter {
    /// Priority: explicit ids, then all guests, then tags, then RSVP statuses.
    pub fn selector(&self) -> Option<TargetSelector> {
        if let Some(ids) = &self.guest_ids {
            return Some(TargetSelector::GuestIds {
                guest_ids: ids.clone(),
            });
        }
        if self.all_guests {
            return Some(TargetSelector::AllGuests);
        }
        if let Some(tags) = &self.tags {
            return Some(TargetSelector::Tags {
                tags: tags.clone(),
                require_all: self.require_all_tags,
            });
        }
        self.rsvp_statuses
            .as_ref()
            .map(|statuses| TargetSelector::RsvpStatuses {
                statuses: statuses.clone(),
                include_declined: self.include_declined,
            })
    }
}

// -- Scheduled messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

text_enum!(ScheduleStatus, "schedule_status" {
    Scheduled => "scheduled",
    Sending => "sending",
    Sent => "sent",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ScheduleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// Nothing ever re-enters `scheduled`.
    pub fn can_transition_to(self, next: ScheduleStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Sending)
                | (Self::Scheduled, Self::Cancelled)
                | (Self::Sending, Self::Sent)
                | (Self::Sending, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub event_id: Uuid,
    pub sender_user_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub target: TargetSelector,
    pub channels: ChannelSet,
    pub send_at: DateTime<Utc>,
    pub recipient_count: u32,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub message_id: Option<Uuid>,
    pub success_count: u32,
    pub failure_count: u32,
}
