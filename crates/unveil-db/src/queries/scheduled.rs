use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use unveil_types::{ScheduledMessage, TargetSelector};

use crate::Database;
use crate::convert::{opt_ts, parse_id, ts};
use crate::models::{SCHEDULED_COLUMNS, ScheduledMessageRow};
use crate::queries::OptionalExt;

/// Outcome written when a claimed scheduled message finishes dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCompletion {
    pub message_id: Uuid,
    pub success_count: u32,
    pub failure_count: u32,
}

/// Column values for a target selector. Lists are stored as JSON text.
struct TargetColumns {
    kind: &'static str,
    guest_ids: Option<String>,
    tags: Option<String>,
    require_all_tags: bool,
    rsvp_statuses: Option<String>,
    include_declined: bool,
}

impl TargetColumns {
    fn encode(target: &TargetSelector) -> Result<Self> {
        let mut cols = Self {
            kind: target.kind(),
            guest_ids: None,
            tags: None,
            require_all_tags: false,
            rsvp_statuses: None,
            include_declined: false,
        };
        match target {
            TargetSelector::AllGuests => {}
            TargetSelector::GuestIds { guest_ids } => {
                cols.guest_ids = Some(serde_json::to_string(guest_ids)?);
            }
            TargetSelector::Tags { tags, require_all } => {
                cols.tags = Some(serde_json::to_string(tags)?);
                cols.require_all_tags = *require_all;
            }
            TargetSelector::RsvpStatuses {
                statuses,
                include_declined,
            } => {
                cols.rsvp_statuses = Some(serde_json::to_string(statuses)?);
                cols.include_declined = *include_declined;
            }
        }
        Ok(cols)
    }
}

impl Database {
    // -- Scheduled messages --

    pub fn insert_scheduled(&self, scheduled: &ScheduledMessage) -> Result<()> {
        let target = TargetColumns::encode(&scheduled.target)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO scheduled_messages ({SCHEDULED_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
                ),
                params![
                    scheduled.id.to_string(),
                    scheduled.event_id.to_string(),
                    scheduled.sender_user_id.to_string(),
                    scheduled.content,
                    scheduled.message_type.as_str(),
                    target.kind,
                    target.guest_ids,
                    target.tags,
                    target.require_all_tags,
                    target.rsvp_statuses,
                    target.include_declined,
                    scheduled.channels.sms,
                    scheduled.channels.push,
                    scheduled.channels.email,
                    ts(scheduled.send_at),
                    scheduled.recipient_count,
                    scheduled.status.as_str(),
                    ts(scheduled.created_at),
                    opt_ts(scheduled.claimed_at),
                    opt_ts(scheduled.processed_at),
                    scheduled.failure_reason,
                    scheduled.message_id.map(|id| id.to_string()),
                    scheduled.success_count,
                    scheduled.failure_count,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                [id.to_string()],
                ScheduledMessageRow::from_row,
            )
            .optional()
        })?;
        row.map(ScheduledMessageRow::into_scheduled).transpose()
    }

    pub fn list_scheduled_for_event(&self, event_id: Uuid) -> Result<Vec<ScheduledMessage>> {
        self.list_scheduled_where("event_id = ?1 ORDER BY send_at, id", &event_id.to_string())
    }

    /// Every row whose stored count may be stale: explicit-id targets in
    /// any state, and anything still waiting to be sent.
    pub fn list_backfill_candidates(&self) -> Result<Vec<ScheduledMessage>> {
        self.list_scheduled_where(
            "(target_kind = ?1 OR status = 'scheduled') ORDER BY created_at, id",
            "guest_ids",
        )
    }

    fn list_scheduled_where(&self, clause: &str, param: &str) -> Result<Vec<ScheduledMessage>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE {clause}"
            ))?;
            let rows = stmt
                .query_map([param], ScheduledMessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(ScheduledMessageRow::into_scheduled).collect()
    }

    /// Ids of rows due for dispatch, oldest first.
    pub fn list_due_scheduled(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Uuid>> {
        self.list_ids(
            "SELECT id FROM scheduled_messages
             WHERE status = 'scheduled' AND send_at <= ?1
             ORDER BY send_at, id
             LIMIT ?2",
            params![ts(now), limit],
        )
    }

    /// Ids of rows claimed before `cutoff` that never finished.
    pub fn list_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.list_ids(
            "SELECT id FROM scheduled_messages
             WHERE status = 'sending' AND claimed_at < ?1
             ORDER BY claimed_at, id",
            params![ts(cutoff)],
        )
    }

    fn list_ids(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Uuid>> {
        let raw = self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let ids = stmt
                .query_map(params, |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        raw.iter().map(|id| parse_id(id)).collect()
    }

    /// Atomic `scheduled -> sending`. Exactly one caller gets `true` for a
    /// given row; every other concurrent caller gets `false`.
    pub fn claim_scheduled(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_messages SET status = 'sending', claimed_at = ?1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![ts(now), id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Atomic `scheduled -> cancelled`.
    pub fn cancel_scheduled(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_messages SET status = 'cancelled', processed_at = ?1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![ts(now), id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn update_recipient_count(&self, id: Uuid, count: u32) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_messages SET recipient_count = ?1 WHERE id = ?2",
                params![count, id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Atomic `sending -> sent`, recording the produced message.
    pub fn complete_scheduled(&self, id: Uuid, done: &SendCompletion, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_messages
                 SET status = 'sent', processed_at = ?1, message_id = ?2,
                     success_count = ?3, failure_count = ?4
                 WHERE id = ?5 AND status = 'sending'",
                params![
                    ts(now),
                    done.message_id.to_string(),
                    done.success_count,
                    done.failure_count,
                    id.to_string()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Atomic `sending -> failed`. `message_id` is set when a message row
    /// was already written before the failure.
    pub fn fail_scheduled(
        &self,
        id: Uuid,
        reason: &str,
        message_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_messages
                 SET status = 'failed', processed_at = ?1, failure_reason = ?2,
                     message_id = COALESCE(?3, message_id)
                 WHERE id = ?4 AND status = 'sending'",
                params![ts(now), reason, message_id.map(|m| m.to_string()), id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record the message a row produced after the row already left
    /// `sending`. Never replaces an existing link.
    pub fn link_scheduled_message(&self, id: Uuid, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_messages SET message_id = ?1
                 WHERE id = ?2 AND message_id IS NULL",
                params![message_id.to_string(), id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }
}
