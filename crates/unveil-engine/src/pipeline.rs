//! Immediate send path: resolve, store, dispatch, track.
//!
//! The scheduler reuses [`SendPipeline::deliver`] after its own claim and
//! re-resolution, so both paths compose and dispatch identically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{StreamExt, stream};
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use unveil_db::Database;
use unveil_messaging::resolver::{RecipientSet, require_recipients, resolve, selector_for};
use unveil_messaging::tag::{event_tag_for, validate_event_tag};
use unveil_messaging::{ComplianceConfig, ContactHistory, ResolutionError, compose};
use unveil_types::api::{ChannelSendCounts, SendMessageRequest, SendMessageResponse};
use unveil_types::stats::DeliveryStats;
use unveil_types::{Channel, ChannelSet, ChannelStatus, Delivery, Event, Guest, Message, MessageType, TargetSelector};

use crate::error::{EngineError, blocking};
use crate::providers::{OutboundMessage, ProviderOutcome, ProviderSet};
use crate::tracker::{DeliveryTracker, OutcomeTally};

/// Provider fan-out limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub provider_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_concurrent_batches: 4,
            provider_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub event_id: Uuid,
    pub sender_user_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub target: TargetSelector,
    pub channels: ChannelSet,
    pub scheduled_message_id: Option<Uuid>,
}

impl SendRequest {
    pub fn from_host(event_id: Uuid, sender_user_id: Uuid, req: SendMessageRequest) -> Result<Self, ResolutionError> {
        Ok(Self {
            event_id,
            sender_user_id,
            target: selector_for(&req.filter)?,
            content: req.content,
            message_type: req.message_type,
            channels: req.channels,
            scheduled_message_id: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub message_id: Uuid,
    pub recipient_count: u32,
    pub sms: ChannelSendCounts,
    pub push: ChannelSendCounts,
    pub email: ChannelSendCounts,
    pub stats: DeliveryStats,
    pub warnings: Vec<String>,
}

impl SendReport {
    fn new(message_id: Uuid, recipient_count: u32) -> Self {
        Self {
            message_id,
            recipient_count,
            sms: ChannelSendCounts::default(),
            push: ChannelSendCounts::default(),
            email: ChannelSendCounts::default(),
            stats: DeliveryStats::default(),
            warnings: Vec::new(),
        }
    }

    pub fn counts(&self, channel: Channel) -> &ChannelSendCounts {
        match channel {
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
            Channel::Email => &self.email,
        }
    }

    fn counts_mut(&mut self, channel: Channel) -> &mut ChannelSendCounts {
        match channel {
            Channel::Sms => &mut self.sms,
            Channel::Push => &mut self.push,
            Channel::Email => &mut self.email,
        }
    }

    pub fn into_response(self) -> SendMessageResponse {
        SendMessageResponse {
            message_id: self.message_id,
            recipient_count: self.recipient_count,
            sms: self.sms,
            push: self.push,
            email: self.email,
            warnings: self.warnings,
        }
    }
}

/// One outbound message plus what to persist once the provider accepts it.
struct Prepared {
    message: OutboundMessage,
    guest_id: Uuid,
    marks_first_contact: bool,
}

pub(crate) fn validate_content(content: &str) -> Result<(), EngineError> {
    if content.trim().is_empty() {
        return Err(EngineError::invalid("message content is empty"));
    }
    Ok(())
}

pub(crate) fn validate_channels(channels: ChannelSet) -> Result<(), EngineError> {
    if channels.is_empty() {
        return Err(EngineError::invalid("select at least one delivery channel"));
    }
    Ok(())
}

pub struct SendPipeline {
    db: Arc<Database>,
    tracker: DeliveryTracker,
    providers: ProviderSet,
    compliance: ComplianceConfig,
    settings: DispatchSettings,
}

impl SendPipeline {
    pub fn new(
        db: Arc<Database>,
        providers: ProviderSet,
        compliance: ComplianceConfig,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            tracker: DeliveryTracker::new(db.clone()),
            db,
            providers,
            compliance,
            settings,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn compliance(&self) -> ComplianceConfig {
        self.compliance
    }

    /// Resolve recipients against the current roster, then store and
    /// dispatch. Nothing is stored when resolution fails.
    pub async fn send(&self, request: SendRequest) -> Result<SendReport, EngineError> {
        validate_content(&request.content)?;
        validate_channels(request.channels)?;

        let (event, roster) = load_roster(&self.db, request.event_id).await?;
        let recipients = require_recipients(resolve(&roster, &request.target, request.channels)?)?;

        self.deliver(&event, &roster, &recipients, request).await
    }

    /// Store the message and its deliveries for an already-resolved set,
    /// then dispatch every requested channel.
    ///
    /// Fails with [`EngineError::TrackingGap`] when the message row was
    /// written but its deliveries were not; nothing is dispatched then.
    pub async fn deliver(
        &self,
        event: &Event,
        roster: &[Guest],
        recipients: &RecipientSet,
        request: SendRequest,
    ) -> Result<SendReport, EngineError> {
        let message = Message {
            id: Uuid::new_v4(),
            event_id: event.id,
            sender_user_id: request.sender_user_id,
            content: request.content,
            message_type: request.message_type,
            scheduled_message_id: request.scheduled_message_id,
            delivered_count: 0,
            failed_count: 0,
            created_at: Utc::now(),
        };
        let guests: Vec<Guest> = roster.iter().filter(|g| recipients.contains(&g.id)).cloned().collect();
        let mut report = SendReport::new(message.id, u32::try_from(guests.len()).unwrap_or(u32::MAX));
        let channels = request.channels;

        let db = self.db.clone();
        let tracker = self.tracker.clone();
        let stored = blocking(move || {
            db.insert_message(&message)?;
            info!(
                "Message {} created for event {} ({} recipients)",
                message.id,
                message.event_id,
                guests.len()
            );
            let refs: Vec<&Guest> = guests.iter().collect();
            let deliveries = tracker.create_deliveries(&message, &refs, channels)?;
            Ok((message, guests, deliveries))
        })
        .await;
        let (message, guests, deliveries) = match stored {
            Ok(stored) => stored,
            Err(EngineError::TrackingGap(gap)) => {
                error!("Tracking gap: {}", gap);
                return Err(gap.into());
            }
            Err(e) => return Err(e),
        };

        let by_guest: HashMap<Uuid, &Guest> = guests.iter().map(|g| (g.id, g)).collect();
        for channel in channels.iter() {
            let prepared = self.prepare(channel, event, &message, &deliveries, &by_guest, &mut report);
            self.dispatch_channel(channel, prepared, &mut report).await?;
        }

        let tracker = self.tracker.clone();
        let message_id = message.id;
        report.stats = blocking(move || tracker.refresh_counters(message_id)).await?;
        Ok(report)
    }

    fn prepare(
        &self,
        channel: Channel,
        event: &Event,
        message: &Message,
        deliveries: &[Delivery],
        by_guest: &HashMap<Uuid, &Guest>,
        report: &mut SendReport,
    ) -> Vec<Prepared> {
        let tag = event_tag_for(event);
        if channel == Channel::Sms && !self.compliance.full_fallback {
            if let Err(e) = validate_event_tag(&tag) {
                error!("SMS header disabled for event {}: {}", event.id, e);
                report
                    .warnings
                    .push(format!("SMS sent without header or footer: {}", e));
            }
        }

        let mut prepared = Vec::new();
        for delivery in deliveries {
            if delivery.channel(channel).status != ChannelStatus::Pending {
                continue;
            }
            let Some(guest) = by_guest.get(&delivery.guest_id) else {
                continue;
            };

            let (to, body, marks_first_contact) = match channel {
                Channel::Sms => {
                    let contact = ContactHistory::from(*guest);
                    let composed = compose(&tag, &contact, &message.content, &self.compliance);
                    if cfg!(debug_assertions) {
                        let violations = composed.verify(&self.compliance, !contact.is_first_contact());
                        if !violations.is_empty() {
                            error!("Compliance violations for guest {}: {:?}", guest.id, violations);
                        }
                    }
                    (delivery.phone.clone(), composed.text, composed.marks_first_contact)
                }
                Channel::Push => match delivery.user_id {
                    Some(user_id) => (user_id.to_string(), message.content.clone(), false),
                    None => continue,
                },
                Channel::Email => match guest.email.as_deref() {
                    Some(email) => (email.to_string(), message.content.clone(), false),
                    None => continue,
                },
            };

            prepared.push(Prepared {
                message: OutboundMessage {
                    delivery_id: delivery.id,
                    channel,
                    to,
                    body,
                },
                guest_id: guest.id,
                marks_first_contact,
            });
        }
        prepared
    }

    /// Fan one channel out to its provider in bounded, concurrent batches,
    /// then persist the results. One batch never affects another.
    async fn dispatch_channel(
        &self,
        channel: Channel,
        prepared: Vec<Prepared>,
        report: &mut SendReport,
    ) -> Result<(), EngineError> {
        if prepared.is_empty() {
            return Ok(());
        }

        let first_contacts: HashMap<Uuid, Uuid> = prepared
            .iter()
            .filter(|p| p.marks_first_contact)
            .map(|p| (p.message.delivery_id, p.guest_id))
            .collect();
        let outbound: Vec<OutboundMessage> = prepared.into_iter().map(|p| p.message).collect();
        report.counts_mut(channel).attempted = u32::try_from(outbound.len()).unwrap_or(u32::MAX);

        let provider = self.providers.get(channel).clone();
        let timeout = self.settings.provider_timeout;
        let batches: Vec<Vec<OutboundMessage>> = outbound
            .chunks(self.settings.batch_size.max(1))
            .map(<[OutboundMessage]>::to_vec)
            .collect();
        debug!("Dispatching {} {} messages in {} batches", outbound.len(), channel, batches.len());

        let results: Vec<BatchResult> = stream::iter(batches)
            .map(|batch| {
                let provider = provider.clone();
                async move {
                    let ids: Vec<Uuid> = batch.iter().map(|m| m.delivery_id).collect();
                    let result = tokio::time::timeout(timeout, provider.send_batch(batch)).await;
                    (ids, result)
                }
            })
            .buffer_unordered(self.settings.max_concurrent_batches.max(1))
            .collect()
            .await;

        let tracker = self.tracker.clone();
        let db = self.db.clone();
        let provider_name = provider.name().to_string();
        let (tally, warnings) = blocking(move || {
            settle(&tracker, &db, channel, &provider_name, timeout, &first_contacts, results)
        })
        .await?;

        let counts = report.counts_mut(channel);
        counts.accepted += tally.accepted;
        counts.failed += tally.failed;
        report.warnings.extend(warnings);

        Ok(())
    }
}

/// The event and every guest row it has, removed guests included.
pub(crate) async fn load_roster(db: &Arc<Database>, event_id: Uuid) -> Result<(Event, Vec<Guest>), EngineError> {
    let db = db.clone();
    blocking(move || {
        let event = db.get_event(event_id)?.ok_or(EngineError::NotFound("event"))?;
        let roster = db.list_event_guests(event.id)?;
        Ok((event, roster))
    })
    .await
}

type BatchResult = (Vec<Uuid>, Result<anyhow::Result<Vec<ProviderOutcome>>, Elapsed>);

/// Persist one channel's provider results. A failed provider call fails
/// its batch; a timed-out batch stays pending.
fn settle(
    tracker: &DeliveryTracker,
    db: &Database,
    channel: Channel,
    provider: &str,
    timeout: Duration,
    first_contacts: &HashMap<Uuid, Uuid>,
    results: Vec<BatchResult>,
) -> Result<(OutcomeTally, Vec<String>), EngineError> {
    let mut tally = OutcomeTally::default();
    let mut warnings = Vec::new();

    for (ids, result) in results {
        match result {
            Ok(Ok(outcomes)) => {
                let expected: HashSet<Uuid> = ids.iter().copied().collect();
                let outcomes: Vec<_> = outcomes
                    .into_iter()
                    .filter(|o| expected.contains(&o.delivery_id))
                    .collect();

                let applied = tracker.record_outcomes(channel, &outcomes)?;
                tally.accepted += applied.accepted;
                tally.failed += applied.failed;

                let now = Utc::now();
                for outcome in outcomes.iter().filter(|o| o.accepted) {
                    if let Some(guest_id) = first_contacts.get(&outcome.delivery_id) {
                        db.mark_first_contact(*guest_id, now)?;
                    }
                }

                let answered: HashSet<Uuid> = outcomes.iter().map(|o| o.delivery_id).collect();
                let missing = expected.difference(&answered).count();
                if missing > 0 {
                    warn!("{} provider skipped {} messages; left pending", channel, missing);
                    warnings.push(format!("{} provider gave no outcome for {} messages", channel, missing));
                }
            }
            Ok(Err(e)) => {
                warn!("{} provider '{}' failed a batch of {}: {:#}", channel, provider, ids.len(), e);
                let failed = tracker.fail_pending(channel, &ids)?;
                tally.failed += failed;
                warnings.push(format!("{} provider error, {} messages failed: {}", channel, failed, e));
            }
            Err(_) => {
                warn!("{} batch of {} timed out after {:?}", channel, ids.len(), timeout);
                warnings.push(format!(
                    "{} batch of {} timed out; deliveries left pending",
                    channel,
                    ids.len()
                ));
            }
        }
    }

    Ok((tally, warnings))
}
