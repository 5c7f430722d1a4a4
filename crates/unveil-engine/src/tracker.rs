//! Per-recipient delivery rows and their status lifecycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use unveil_db::Database;
use unveil_types::stats::DeliveryStats;
use unveil_types::{Channel, ChannelSet, ChannelState, ChannelStatus, Delivery, Guest, Message};

use crate::error::{EngineError, TrackingGap};
use crate::providers::ProviderOutcome;

/// Result of a status report against a delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// Stale, duplicate or backwards report; nothing changed.
    Ignored,
}

/// Tally of provider outcomes applied to one channel of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub accepted: u32,
    pub failed: u32,
}

#[derive(Clone)]
pub struct DeliveryTracker {
    db: Arc<Database>,
}

impl DeliveryTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Build and store one delivery per recipient in a single transaction.
    /// A channel starts `pending` when it was requested and the guest is
    /// reachable on it, `not_applicable` otherwise.
    pub fn create_deliveries(
        &self,
        message: &Message,
        recipients: &[&Guest],
        channels: ChannelSet,
    ) -> Result<Vec<Delivery>, TrackingGap> {
        let now = Utc::now();
        let deliveries: Vec<Delivery> = recipients
            .iter()
            .map(|guest| {
                let state = |channel: Channel| {
                    if channels.contains(channel) && guest.reachable_on(channel) {
                        ChannelState::new(ChannelStatus::Pending)
                    } else {
                        ChannelState::new(ChannelStatus::NotApplicable)
                    }
                };
                Delivery {
                    id: Uuid::new_v4(),
                    message_id: message.id,
                    guest_id: guest.id,
                    user_id: guest.user_id,
                    phone: guest.phone.clone(),
                    sms: state(Channel::Sms),
                    push: state(Channel::Push),
                    email: state(Channel::Email),
                    has_responded: false,
                    response_message_id: None,
                    created_at: now,
                    updated_at: now,
                }
            })
            .collect();

        self.db
            .insert_deliveries(&deliveries)
            .map_err(|source| TrackingGap {
                message_id: message.id,
                source,
            })?;

        debug!("Created {} deliveries for message {}", deliveries.len(), message.id);
        Ok(deliveries)
    }

    /// Apply a status report to one channel of one delivery. Status only
    /// moves forward; anything else is ignored. Message counters are
    /// refreshed after an applied change.
    pub fn record_delivery_status(
        &self,
        delivery_id: Uuid,
        channel: Channel,
        status: ChannelStatus,
        provider_id: Option<&str>,
    ) -> Result<StatusUpdate, EngineError> {
        let delivery = self
            .db
            .get_delivery(delivery_id)?
            .ok_or(EngineError::NotFound("delivery"))?;

        let update = self.advance(&delivery, channel, status, provider_id)?;
        if update == StatusUpdate::Applied {
            self.db.recompute_message_counters(delivery.message_id)?;
        }
        Ok(update)
    }

    /// Callback entry point: providers report by their own message id.
    pub fn record_status_by_provider_id(
        &self,
        channel: Channel,
        provider_id: &str,
        status: ChannelStatus,
    ) -> Result<StatusUpdate, EngineError> {
        let delivery = self
            .db
            .find_delivery_by_provider_id(channel, provider_id)?
            .ok_or(EngineError::NotFound("delivery"))?;

        let update = self.advance(&delivery, channel, status, None)?;
        if update == StatusUpdate::Applied {
            self.db.recompute_message_counters(delivery.message_id)?;
        }
        Ok(update)
    }

    /// Apply one provider batch's outcomes to `pending` channels. Counters
    /// are not refreshed here; call [`Self::refresh_counters`] once the
    /// whole message is dispatched.
    pub fn record_outcomes(
        &self,
        channel: Channel,
        outcomes: &[ProviderOutcome],
    ) -> Result<OutcomeTally, EngineError> {
        let now = Utc::now();
        let mut tally = OutcomeTally::default();
        for outcome in outcomes {
            let next = if outcome.accepted {
                ChannelStatus::Sent
            } else {
                ChannelStatus::Failed
            };
            let applied = self.db.update_channel_status(
                outcome.delivery_id,
                channel,
                ChannelStatus::Pending,
                next,
                outcome.provider_message_id.as_deref(),
                now,
            )?;
            if !applied {
                debug!("Outcome for delivery {} on {} arrived after a later status", outcome.delivery_id, channel);
                continue;
            }
            if outcome.accepted {
                tally.accepted += 1;
            } else {
                tally.failed += 1;
            }
        }
        Ok(tally)
    }

    /// Mark a whole batch failed, e.g. when the provider call itself errored.
    pub fn fail_pending(&self, channel: Channel, delivery_ids: &[Uuid]) -> Result<u32, EngineError> {
        let now = Utc::now();
        let mut failed = 0;
        for id in delivery_ids {
            if self
                .db
                .update_channel_status(*id, channel, ChannelStatus::Pending, ChannelStatus::Failed, None, now)?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }

    pub fn refresh_counters(&self, message_id: Uuid) -> Result<DeliveryStats, EngineError> {
        Ok(self.db.recompute_message_counters(message_id)?)
    }

    /// Flag a delivery as answered and link the reply. Append-only: the
    /// first linked reply is kept.
    pub fn record_message_response(&self, delivery_id: Uuid, reply_message_id: Uuid) -> Result<(), EngineError> {
        if !self.db.mark_responded(delivery_id, reply_message_id, Utc::now())? {
            return Err(EngineError::NotFound("delivery"));
        }
        Ok(())
    }

    pub fn message_stats(&self, message_id: Uuid) -> Result<DeliveryStats, EngineError> {
        let deliveries = self.db.list_message_deliveries(message_id)?;
        Ok(DeliveryStats::tally(&deliveries))
    }

    fn advance(
        &self,
        delivery: &Delivery,
        channel: Channel,
        status: ChannelStatus,
        provider_id: Option<&str>,
    ) -> Result<StatusUpdate, EngineError> {
        let current = delivery.channel(channel).status;
        if !current.can_advance_to(status) {
            debug!(
                "Ignoring {} -> {} on {} for delivery {}",
                current, status, channel, delivery.id
            );
            return Ok(StatusUpdate::Ignored);
        }

        let applied = self
            .db
            .update_channel_status(delivery.id, channel, current, status, provider_id, Utc::now())?;
        if !applied {
            // Someone else moved the channel between our read and write.
            return Ok(StatusUpdate::Ignored);
        }

        info!("Delivery {} {}: {} -> {}", delivery.id, channel, current, status);
        Ok(StatusUpdate::Applied)
    }
}
