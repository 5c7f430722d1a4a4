use std::collections::BTreeSet;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use unveil_types::display::resolve_display_name;
use unveil_types::{Guest, RsvpStatus};

use crate::Database;
use crate::convert::{opt_ts, ts};
use crate::models::{GUEST_COLUMNS, GuestRow};
use crate::queries::OptionalExt;
use crate::queries::events::refresh_display_names;

/// Roster entry as the host adds it.
#[derive(Debug, Clone)]
pub struct NewGuest {
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    pub guest_name: Option<String>,
    pub phone: String,
    pub email: Option<String>,
    pub rsvp_status: RsvpStatus,
    pub tags: BTreeSet<String>,
    pub sms_opt_out: bool,
}

impl NewGuest {
    pub fn new(event_id: Uuid, guest_name: &str, phone: &str) -> Self {
        Self {
            event_id,
            user_id: None,
            guest_name: Some(guest_name.to_string()),
            phone: phone.to_string(),
            email: None,
            rsvp_status: RsvpStatus::Pending,
            tags: BTreeSet::new(),
            sms_opt_out: false,
        }
    }
}

impl Database {
    // -- Guests --

    /// Insert a roster entry. The cached display name is derived from the
    /// linked account (when there is one) and the host-entered name.
    pub fn insert_guest(&self, new: NewGuest, now: DateTime<Utc>) -> Result<Guest> {
        let tags_json = serde_json::to_string(&new.tags)?;
        let declined_at = (new.rsvp_status == RsvpStatus::Declined).then_some(now);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let full_name: Option<String> = match new.user_id {
                Some(user_id) => tx
                    .query_row(
                        "SELECT full_name FROM users WHERE id = ?1",
                        [user_id.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?
                    .flatten(),
                None => None,
            };
            let display_name = resolve_display_name(full_name.as_deref(), new.guest_name.as_deref());
            let id = Uuid::new_v4();

            tx.execute(
                "INSERT INTO guests (id, event_id, user_id, guest_name, display_name, phone, email,
                                     sms_opt_out, rsvp_status, declined_at, tags, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id.to_string(),
                    new.event_id.to_string(),
                    new.user_id.map(|u| u.to_string()),
                    new.guest_name,
                    display_name,
                    new.phone,
                    new.email,
                    new.sms_opt_out,
                    new.rsvp_status.as_str(),
                    opt_ts(declined_at),
                    tags_json,
                    ts(now),
                ],
            )?;
            tx.commit()?;

            Ok(Guest {
                id,
                event_id: new.event_id,
                user_id: new.user_id,
                guest_name: new.guest_name,
                display_name,
                phone: new.phone,
                email: new.email,
                sms_opt_out: new.sms_opt_out,
                rsvp_status: new.rsvp_status,
                declined_at,
                removed_at: None,
                tags: new.tags,
                first_contact_at: None,
                created_at: now,
            })
        })
    }

    pub fn get_guest(&self, id: Uuid) -> Result<Option<Guest>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {GUEST_COLUMNS} FROM guests WHERE id = ?1"),
                [id.to_string()],
                GuestRow::from_row,
            )
            .optional()
        })?;
        row.map(GuestRow::into_guest).transpose()
    }

    /// The caller's roster entry for an event. An active entry wins over a
    /// removed one so that re-added guests are not shadowed by history.
    pub fn find_guest_for_user(&self, event_id: Uuid, user_id: Uuid) -> Result<Option<Guest>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {GUEST_COLUMNS} FROM guests
                     WHERE event_id = ?1 AND user_id = ?2
                     ORDER BY removed_at IS NOT NULL, created_at DESC
                     LIMIT 1"
                ),
                params![event_id.to_string(), user_id.to_string()],
                GuestRow::from_row,
            )
            .optional()
        })?;
        row.map(GuestRow::into_guest).transpose()
    }

    /// Full roster of an event, removed entries included. The resolver
    /// decides who is eligible.
    pub fn list_event_guests(&self, event_id: Uuid) -> Result<Vec<Guest>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GUEST_COLUMNS} FROM guests WHERE event_id = ?1 ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map([event_id.to_string()], GuestRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(GuestRow::into_guest).collect()
    }

    /// Attach an account to a roster entry and refresh its display name.
    pub fn link_guest_user(&self, guest_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE guests SET user_id = ?1 WHERE id = ?2",
                params![user_id.to_string(), guest_id.to_string()],
            )?;
            if changed == 0 {
                bail!("Guest not found: {}", guest_id);
            }
            refresh_display_names(&tx, "g.id = ?1", &guest_id.to_string())?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Record an RSVP. `declined_at` is stamped on the first decline and
    /// cleared when the guest changes their answer.
    pub fn set_guest_rsvp(&self, guest_id: Uuid, status: RsvpStatus, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE guests
                 SET rsvp_status = ?1,
                     declined_at = CASE WHEN ?1 = 'declined' THEN COALESCE(declined_at, ?2) ELSE NULL END
                 WHERE id = ?3",
                params![status.as_str(), ts(now), guest_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_guest_opt_out(&self, guest_id: Uuid, opted_out: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE guests SET sms_opt_out = ?1 WHERE id = ?2",
                params![opted_out, guest_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Soft-delete. Returns false when the guest was already removed.
    pub fn remove_guest(&self, guest_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE guests SET removed_at = ?1 WHERE id = ?2 AND removed_at IS NULL",
                params![ts(now), guest_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Stamp the first SMS contact. Only the first call for a guest wins.
    pub fn mark_first_contact(&self, guest_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE guests SET first_contact_at = ?1 WHERE id = ?2 AND first_contact_at IS NULL",
                params![ts(at), guest_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }
}
