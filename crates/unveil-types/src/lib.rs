pub mod api;
pub mod display;
pub mod models;
pub mod stats;

pub use models::{
    Channel, ChannelSet, ChannelState, ChannelStatus, ChannelStatuses, Delivery, Event, Guest,
    Message, MessageType, RecipientFilter, RsvpStatus, ScheduleStatus, ScheduledMessage,
    TargetSelector, UnknownVariant, User,
};
