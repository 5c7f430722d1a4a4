//! Delivery outcome predicates.
//!
//! Every place that reports how a message fared (the counters stored on the
//! message row, the host statistics endpoint, the guest's own delivery
//! badge) goes through the functions in this module.

use serde::{Deserialize, Serialize};

use crate::models::{Channel, ChannelStatus, ChannelStatuses, Delivery};

/// Condensed status of one delivery as shown to its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySummary {
    Pending,
    Delivered,
    Failed,
    /// No external channel was requested; the message lives in the app only.
    InApp,
}

impl ChannelStatuses {
    fn requested(&self) -> impl Iterator<Item = ChannelStatus> + '_ {
        Channel::ALL
            .into_iter()
            .map(|c| self.get(c))
            .filter(|s| s.is_requested())
    }

    /// At least one requested channel reached a delivered-equivalent state.
    pub fn counts_as_delivered(&self) -> bool {
        self.requested().any(ChannelStatus::is_delivered_equivalent)
    }

    /// Every requested channel failed. A delivery with no requested
    /// channels is never failed.
    pub fn counts_as_failed(&self) -> bool {
        let mut requested = self.requested().peekable();
        requested.peek().is_some() && requested.all(|s| s == ChannelStatus::Failed)
    }

    pub fn summary(&self) -> DeliverySummary {
        if self.requested().next().is_none() {
            DeliverySummary::InApp
        } else if self.counts_as_delivered() {
            DeliverySummary::Delivered
        } else if self.counts_as_failed() {
            DeliverySummary::Failed
        } else {
            DeliverySummary::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTally {
    pub pending: u32,
    pub sent: u32,
    pub delivered: u32,
    pub failed: u32,
}

impl ChannelTally {
    fn add(&mut self, status: ChannelStatus) {
        let slot = match status {
            ChannelStatus::Pending => &mut self.pending,
            ChannelStatus::Sent => &mut self.sent,
            ChannelStatus::Delivered => &mut self.delivered,
            ChannelStatus::Failed => &mut self.failed,
            ChannelStatus::NotApplicable => return,
        };
        *slot = slot.saturating_add(1);
    }
}

/// Aggregate view over all deliveries of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total: u32,
    pub delivered: u32,
    pub failed: u32,
    pub pending: u32,
    pub responded: u32,
    pub sms: ChannelTally,
    pub push: ChannelTally,
    pub email: ChannelTally,
}

impl DeliveryStats {
    pub fn tally<'a, I>(deliveries: I) -> Self
    where
        I: IntoIterator<Item = &'a Delivery>,
    {
        let mut stats = Self::default();
        for delivery in deliveries {
            let statuses = delivery.statuses();
            stats.total = stats.total.saturating_add(1);
            match statuses.summary() {
                DeliverySummary::Delivered => stats.delivered = stats.delivered.saturating_add(1),
                DeliverySummary::Failed => stats.failed = stats.failed.saturating_add(1),
                DeliverySummary::Pending => stats.pending = stats.pending.saturating_add(1),
                DeliverySummary::InApp => {}
            }
            if delivery.has_responded {
                stats.responded = stats.responded.saturating_add(1);
            }
            stats.sms.add(statuses.sms);
            stats.push.add(statuses.push);
            stats.email.add(statuses.email);
        }
        stats
    }
}
