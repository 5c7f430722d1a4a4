use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Channel, ChannelSet, ChannelStatus, MessageType, RecipientFilter};
use crate::stats::DeliverySummary;

// -- JWT Claims --

/// Bearer token claims. Tokens are issued by the account service; this
/// workspace only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Guest read path --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestMessage {
    pub message_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliverySummary,
    pub sender_name: String,
    pub message_type: MessageType,
    pub is_own_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<GuestMessage>,
    /// Pass back as `before` to fetch the next (older) page.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyResponse {
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// -- Host send path --

fn default_message_type() -> MessageType {
    MessageType::Announcement
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
    pub filter: RecipientFilter,
    pub channels: ChannelSet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSendCounts {
    /// Messages handed to the provider.
    pub attempted: u32,
    pub accepted: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub recipient_count: u32,
    pub sms: ChannelSendCounts,
    pub push: ChannelSendCounts,
    pub email: ChannelSendCounts,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleMessageRequest {
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
    pub filter: RecipientFilter,
    pub channels: ChannelSet,
    pub send_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PreviewRecipientsRequest {
    pub filter: RecipientFilter,
    #[serde(default = "ChannelSet::sms_only")]
    pub channels: ChannelSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRecipientsResponse {
    pub recipient_count: u32,
    pub guest_ids: Vec<Uuid>,
}

// -- Provider callbacks --

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryStatusCallback {
    pub channel: Channel,
    pub provider_message_id: String,
    pub status: ChannelStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
