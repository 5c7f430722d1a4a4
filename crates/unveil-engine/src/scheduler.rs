//! Scheduled message lifecycle: `scheduled -> sending -> {sent | failed}`
//! and `scheduled -> cancelled`.
//!
//! The claim (`scheduled -> sending`) is a single conditional UPDATE, so any
//! number of workers may poll the same database; exactly one of them
//! dispatches each row.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use unveil_db::{Database, SendCompletion};
use unveil_messaging::resolver::{require_recipients, resolve, selector_for};
use unveil_types::api::ScheduleMessageRequest;
use unveil_types::{Guest, ScheduleStatus, ScheduledMessage, TargetSelector};

use crate::error::{EngineError, blocking};
use crate::pipeline::{SendPipeline, SendReport, SendRequest, load_roster, validate_channels, validate_content};

pub const CLAIM_EXPIRED_REASON: &str = "claim expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another worker got there first, or the row was cancelled.
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub examined: usize,
    pub corrected: usize,
}

/// How a claimed row ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Sent,
    Failed,
    /// The row left `sending` under us, e.g. its claim expired mid-send.
    ClaimLost,
}

#[derive(Clone)]
pub struct SchedulingEngine {
    db: Arc<Database>,
    pipeline: Arc<SendPipeline>,
    batch_size: u32,
}

impl SchedulingEngine {
    pub fn new(pipeline: Arc<SendPipeline>, batch_size: u32) -> Self {
        Self {
            db: pipeline.db().clone(),
            pipeline,
            batch_size: batch_size.max(1),
        }
    }

    /// Validate and store a future send. Recipients are resolved now so
    /// that bad explicit ids are reported to the host immediately, and
    /// the stored count reflects the roster at scheduling time.
    pub fn schedule(
        &self,
        event_id: Uuid,
        sender_user_id: Uuid,
        req: ScheduleMessageRequest,
        now: DateTime<Utc>,
    ) -> Result<ScheduledMessage, EngineError> {
        validate_content(&req.content)?;
        validate_channels(req.channels)?;
        if req.send_at <= now {
            return Err(EngineError::invalid("send_at must be in the future"));
        }

        let target = selector_for(&req.filter)?;
        let event = self
            .db
            .get_event(event_id)?
            .ok_or(EngineError::NotFound("event"))?;
        let roster = self.db.list_event_guests(event.id)?;
        let resolved = require_recipients(resolve(&roster, &target, req.channels)?)?;

        let scheduled = ScheduledMessage {
            id: Uuid::new_v4(),
            event_id: event.id,
            sender_user_id,
            content: req.content,
            message_type: req.message_type,
            target,
            channels: req.channels,
            send_at: req.send_at,
            recipient_count: count_of(resolved.len()),
            status: ScheduleStatus::Scheduled,
            created_at: now,
            claimed_at: None,
            processed_at: None,
            failure_reason: None,
            message_id: None,
            success_count: 0,
            failure_count: 0,
        };
        self.db.insert_scheduled(&scheduled)?;

        info!(
            "Scheduled message {} for event {} at {} ({} recipients)",
            scheduled.id, event.id, scheduled.send_at, scheduled.recipient_count
        );
        Ok(scheduled)
    }

    pub fn get(&self, id: Uuid) -> Result<ScheduledMessage, EngineError> {
        self.db
            .get_scheduled(id)?
            .ok_or(EngineError::NotFound("scheduled message"))
    }

    pub fn list_for_event(&self, event_id: Uuid) -> Result<Vec<ScheduledMessage>, EngineError> {
        Ok(self.db.list_scheduled_for_event(event_id)?)
    }

    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<ScheduledMessage, EngineError> {
        let current = self.get(id)?;
        if !self.db.cancel_scheduled(id, now)? {
            // Re-read: the row may have been claimed since we loaded it.
            let from = self
                .db
                .get_scheduled(id)?
                .map_or(current.status, |s| s.status);
            return Err(EngineError::InvalidTransition {
                from,
                to: ScheduleStatus::Cancelled,
            });
        }
        info!("Cancelled scheduled message {}", id);
        self.get(id)
    }

    pub fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<ClaimOutcome, EngineError> {
        if self.db.claim_scheduled(id, now)? {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Conflict)
        }
    }

    /// Claim and dispatch every row due at `now`, oldest first, up to the
    /// batch size.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<ProcessReport, EngineError> {
        let db = self.db.clone();
        let limit = self.batch_size;
        let due = blocking(move || Ok(db.list_due_scheduled(now, limit)?)).await?;
        let mut report = ProcessReport {
            due: due.len(),
            ..ProcessReport::default()
        };

        for id in due {
            let this = self.clone();
            if blocking(move || this.claim(id, now)).await? == ClaimOutcome::Conflict {
                warn!("Scheduled message {} was claimed elsewhere", id);
                report.conflicts += 1;
                continue;
            }
            match self.dispatch_claimed(id).await {
                Ok(Finish::Sent) => report.sent += 1,
                Ok(Finish::Failed) => report.failed += 1,
                Ok(Finish::ClaimLost) => report.conflicts += 1,
                Err(e) => {
                    error!("Scheduled message {} could not be finalized: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run a claimed row to completion.
    async fn dispatch_claimed(&self, id: Uuid) -> Result<Finish, EngineError> {
        let this = self.clone();
        let scheduled = blocking(move || this.get(id)).await?;

        match self.send_claimed(&scheduled).await {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!("Scheduled message {}: {}", id, warning);
                }
                let done = SendCompletion {
                    message_id: report.message_id,
                    success_count: report.stats.delivered,
                    failure_count: report.stats.failed,
                };
                let db = self.db.clone();
                let completed = blocking(move || {
                    if db.complete_scheduled(id, &done, Utc::now())? {
                        return Ok(true);
                    }
                    db.link_scheduled_message(id, done.message_id)?;
                    Ok(false)
                })
                .await?;
                if !completed {
                    error!(
                        "Scheduled message {} went out as {} after its claim was lost",
                        id, report.message_id
                    );
                    return Ok(Finish::ClaimLost);
                }
                info!(
                    "Scheduled message {} sent as {} ({} delivered, {} failed)",
                    id, report.message_id, report.stats.delivered, report.stats.failed
                );
                Ok(Finish::Sent)
            }
            Err(e) => {
                let reason = e.to_string();
                let message_id = match &e {
                    EngineError::TrackingGap(gap) => Some(gap.message_id),
                    _ => None,
                };
                let db = self.db.clone();
                let stored_reason = reason.clone();
                let failed =
                    blocking(move || Ok(db.fail_scheduled(id, &stored_reason, message_id, Utc::now())?)).await?;
                if !failed {
                    error!("Scheduled message {} failed after its claim was lost: {}", id, reason);
                    return Ok(Finish::ClaimLost);
                }
                warn!("Scheduled message {} failed: {}", id, reason);
                Ok(Finish::Failed)
            }
        }
    }

    /// The claim-time roster is authoritative: re-resolve, correct the
    /// stored count, then hand off to the send pipeline.
    async fn send_claimed(&self, scheduled: &ScheduledMessage) -> Result<SendReport, EngineError> {
        let (event, roster) = load_roster(&self.db, scheduled.event_id).await?;
        let resolved = require_recipients(resolve(&roster, &scheduled.target, scheduled.channels)?)?;

        let count = count_of(resolved.len());
        if count != scheduled.recipient_count {
            info!(
                "Scheduled message {} recipient count drifted {} -> {}",
                scheduled.id, scheduled.recipient_count, count
            );
            let db = self.db.clone();
            let id = scheduled.id;
            blocking(move || Ok(db.update_recipient_count(id, count)?)).await?;
        }

        let request = SendRequest {
            event_id: event.id,
            sender_user_id: scheduled.sender_user_id,
            content: scheduled.content.clone(),
            message_type: scheduled.message_type,
            target: scheduled.target.clone(),
            channels: scheduled.channels,
            scheduled_message_id: Some(scheduled.id),
        };
        self.pipeline.deliver(&event, &roster, &resolved, request).await
    }

    /// Repair stored recipient counts. Rows still waiting are re-resolved
    /// against the current roster. Rows past `scheduled` keep the count
    /// their claim recorded, except that an explicit-id row never keeps more
    /// than its distinct target ids. Running it twice changes nothing the
    /// second time.
    pub fn backfill_recipient_counts(&self) -> Result<BackfillReport, EngineError> {
        let candidates = self.db.list_backfill_candidates()?;
        let mut rosters: HashMap<Uuid, Vec<Guest>> = HashMap::new();
        let mut report = BackfillReport::default();

        for scheduled in candidates {
            report.examined += 1;

            let ceiling = distinct_target_ids(&scheduled.target).map(|n| n.min(scheduled.recipient_count));
            let expected = if scheduled.status == ScheduleStatus::Scheduled {
                let roster = match rosters.entry(scheduled.event_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(self.db.list_event_guests(scheduled.event_id)?),
                };
                match resolve(roster, &scheduled.target, scheduled.channels) {
                    Ok(set) => count_of(set.len()),
                    Err(e) => {
                        warn!("Backfill could not resolve scheduled message {}: {}", scheduled.id, e);
                        match ceiling {
                            Some(ceiling) => ceiling,
                            None => continue,
                        }
                    }
                }
            } else {
                match ceiling {
                    Some(ceiling) => ceiling,
                    None => continue,
                }
            };

            if expected != scheduled.recipient_count {
                self.db.update_recipient_count(scheduled.id, expected)?;
                info!(
                    "Backfill corrected scheduled message {}: {} -> {}",
                    scheduled.id, scheduled.recipient_count, expected
                );
                report.corrected += 1;
            }
        }

        Ok(report)
    }

    /// Fail rows stuck in `sending` for longer than `max_age`. A worker that
    /// died mid-dispatch leaves these behind; they never go back to
    /// `scheduled`.
    pub fn expire_stale_claims(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let stale = self.db.list_stale_claims(now - max_age)?;
        let mut expired = 0;
        for id in stale {
            if self.db.fail_scheduled(id, CLAIM_EXPIRED_REASON, None, now)? {
                warn!("Scheduled message {} claim expired", id);
                expired += 1;
            }
        }
        Ok(expired)
    }
}

fn count_of(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn distinct_target_ids(target: &TargetSelector) -> Option<u32> {
    match target {
        TargetSelector::GuestIds { guest_ids } => Some(count_of(guest_ids.iter().collect::<BTreeSet<_>>().len())),
        _ => None,
    }
}

/// Background worker. Each tick expires stale claims, then dispatches
/// whatever is due.
pub async fn run_scheduler_loop(engine: Arc<SchedulingEngine>, interval_secs: u64, claim_timeout: chrono::Duration) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        interval.tick().await;
        let now = Utc::now();

        let expiring = engine.clone();
        match blocking(move || expiring.expire_stale_claims(claim_timeout, now)).await {
            Ok(0) => {}
            Ok(count) => info!("Scheduler: expired {} stale claims", count),
            Err(e) => warn!("Scheduler claim expiry error: {}", e),
        }

        match engine.process_due(now).await {
            Ok(report) => {
                if report.due > 0 {
                    info!(
                        "Scheduler: {} due, {} sent, {} failed, {} conflicts",
                        report.due, report.sent, report.failed, report.conflicts
                    );
                }
            }
            Err(e) => {
                warn!("Scheduler error: {}", e);
            }
        }
    }
}
