use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use unveil_types::{Channel, ChannelStatus, Delivery};

use crate::Database;
use crate::convert::ts;
use crate::models::{DELIVERY_COLUMNS, DeliveryRow, InboxEntry, InboxRow};
use crate::queries::OptionalExt;

/// Position in a guest's inbox. Pages are ordered by `(created_at, id)`
/// descending and a page continues strictly below its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxCursorKey {
    pub created_at: DateTime<Utc>,
    pub message_id: Uuid,
}

fn status_columns(channel: Channel) -> (&'static str, &'static str) {
    match channel {
        Channel::Sms => ("sms_status", "sms_provider_id"),
        Channel::Push => ("push_status", "push_provider_id"),
        Channel::Email => ("email_status", "email_provider_id"),
    }
}

impl Database {
    // -- Deliveries --

    /// Insert all rows for one message atomically. A duplicate
    /// (message, guest) pair aborts the whole batch.
    pub fn insert_deliveries(&self, deliveries: &[Delivery]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO deliveries (id, message_id, guest_id, user_id, phone,
                                             sms_status, sms_provider_id, push_status, push_provider_id,
                                             email_status, email_provider_id, has_responded,
                                             response_message_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?;
                for d in deliveries {
                    stmt.execute(params![
                        d.id.to_string(),
                        d.message_id.to_string(),
                        d.guest_id.to_string(),
                        d.user_id.map(|u| u.to_string()),
                        d.phone,
                        d.sms.status.as_str(),
                        d.sms.provider_message_id,
                        d.push.status.as_str(),
                        d.push.provider_message_id,
                        d.email.status.as_str(),
                        d.email.provider_message_id,
                        d.has_responded,
                        d.response_message_id.map(|m| m.to_string()),
                        ts(d.created_at),
                        ts(d.updated_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"),
                [id.to_string()],
                DeliveryRow::from_row,
            )
            .optional()
        })?;
        row.map(DeliveryRow::into_delivery).transpose()
    }

    pub fn find_delivery(&self, message_id: Uuid, guest_id: Uuid) -> Result<Option<Delivery>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE message_id = ?1 AND guest_id = ?2"),
                params![message_id.to_string(), guest_id.to_string()],
                DeliveryRow::from_row,
            )
            .optional()
        })?;
        row.map(DeliveryRow::into_delivery).transpose()
    }

    pub fn list_message_deliveries(&self, message_id: Uuid) -> Result<Vec<Delivery>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE message_id = ?1 ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map([message_id.to_string()], DeliveryRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(DeliveryRow::into_delivery).collect()
    }

    pub fn find_delivery_by_provider_id(&self, channel: Channel, provider_id: &str) -> Result<Option<Delivery>> {
        let (_, provider_col) = status_columns(channel);
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE {provider_col} = ?1 LIMIT 1"),
                [provider_id],
                DeliveryRow::from_row,
            )
            .optional()
        })?;
        row.map(DeliveryRow::into_delivery).transpose()
    }

    /// Compare-and-swap one channel's status. The row changes only if the
    /// channel still holds `expected`; a provider id, when given, replaces
    /// the stored one. Returns whether the row was updated.
    pub fn update_channel_status(
        &self,
        delivery_id: Uuid,
        channel: Channel,
        expected: ChannelStatus,
        next: ChannelStatus,
        provider_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (status_col, provider_col) = status_columns(channel);
        self.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE deliveries
                     SET {status_col} = ?1, {provider_col} = COALESCE(?2, {provider_col}), updated_at = ?3
                     WHERE id = ?4 AND {status_col} = ?5"
                ),
                params![
                    next.as_str(),
                    provider_id,
                    ts(now),
                    delivery_id.to_string(),
                    expected.as_str()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Flag a delivery as answered. The first linked reply is kept.
    pub fn mark_responded(&self, delivery_id: Uuid, reply_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE deliveries
                 SET has_responded = 1,
                     response_message_id = COALESCE(response_message_id, ?1),
                     updated_at = ?2
                 WHERE id = ?3",
                params![reply_id.to_string(), ts(now), delivery_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Inbox --

    /// One page of a guest's messages. The query is driven by the guest's
    /// delivery rows: a message without a delivery for this guest is never
    /// returned, whatever the guest's event membership.
    pub fn list_inbox(
        &self,
        guest_id: Uuid,
        event_id: Uuid,
        before: Option<InboxCursorKey>,
        limit: u32,
    ) -> Result<Vec<InboxEntry>> {
        let (before_at, before_id) = match before {
            Some(key) => (Some(ts(key.created_at)), Some(key.message_id.to_string())),
            None => (None, None),
        };

        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.content, m.message_type, m.created_at, m.sender_user_id,
                        d.sms_status, d.push_status, d.email_status,
                        u.full_name,
                        (SELECT sg.guest_name FROM guests sg
                          WHERE sg.event_id = m.event_id
                            AND sg.user_id = m.sender_user_id
                            AND sg.guest_name IS NOT NULL
                          ORDER BY sg.created_at
                          LIMIT 1)
                 FROM deliveries d
                 JOIN messages m ON m.id = d.message_id
                 LEFT JOIN users u ON u.id = m.sender_user_id
                 WHERE d.guest_id = ?1
                   AND m.event_id = ?2
                   AND (?3 IS NULL OR m.created_at < ?3 OR (m.created_at = ?3 AND m.id < ?4))
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?5",
            )?;
            let rows = stmt
                .query_map(
                    params![guest_id.to_string(), event_id.to_string(), before_at, before_id, limit],
                    InboxRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(InboxRow::into_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::guests::NewGuest;
    use chrono::TimeZone;
    use unveil_types::{ChannelState, Event, Message, MessageType, User};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, minute, 0).unwrap()
    }

    struct Fixture {
        db: Database,
        host: User,
        event: Event,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let host = User {
            id: Uuid::new_v4(),
            full_name: Some("Sarah Host".into()),
            phone: Some("+15550000000".into()),
            created_at: at(0),
        };
        db.create_user(&host).unwrap();
        let event = Event {
            id: Uuid::new_v4(),
            title: "Test Wedding".into(),
            host_user_id: host.id,
            sms_tag: Some("TestWed".into()),
            created_at: at(0),
        };
        db.create_event(&event).unwrap();
        Fixture { db, host, event }
    }

    fn message(fx: &Fixture, minute: u32, message_type: MessageType) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            event_id: fx.event.id,
            sender_user_id: fx.host.id,
            content: format!("message at {minute}"),
            message_type,
            scheduled_message_id: None,
            delivered_count: 0,
            failed_count: 0,
            created_at: at(minute),
        };
        fx.db.insert_message(&message).unwrap();
        message
    }

    fn delivery(message: &Message, guest_id: Uuid, sms: ChannelStatus) -> Delivery {
        Delivery {
            id: Uuid::new_v4(),
            message_id: message.id,
            guest_id,
            user_id: None,
            phone: "+15551111111".into(),
            sms: ChannelState::new(sms),
            push: ChannelState::new(ChannelStatus::NotApplicable),
            email: ChannelState::new(ChannelStatus::NotApplicable),
            has_responded: false,
            response_message_id: None,
            created_at: message.created_at,
            updated_at: message.created_at,
        }
    }

    #[test]
    fn duplicate_delivery_rolls_back_batch() {
        let fx = fixture();
        let guest = fx
            .db
            .insert_guest(NewGuest::new(fx.event.id, "Alice", "+15551111111"), at(0))
            .unwrap();
        let msg = message(&fx, 1, MessageType::Announcement);

        let first = delivery(&msg, guest.id, ChannelStatus::Pending);
        let dup = delivery(&msg, guest.id, ChannelStatus::Pending);
        assert!(fx.db.insert_deliveries(&[first, dup]).is_err());
        assert!(fx.db.list_message_deliveries(msg.id).unwrap().is_empty());
    }

    #[test]
    fn channel_status_swap_requires_expected_value() {
        let fx = fixture();
        let guest = fx
            .db
            .insert_guest(NewGuest::new(fx.event.id, "Alice", "+15551111111"), at(0))
            .unwrap();
        let msg = message(&fx, 1, MessageType::Announcement);
        let d = delivery(&msg, guest.id, ChannelStatus::Pending);
        fx.db.insert_deliveries(std::slice::from_ref(&d)).unwrap();

        let applied = fx
            .db
            .update_channel_status(d.id, Channel::Sms, ChannelStatus::Pending, ChannelStatus::Sent, Some("SM1"), at(2))
            .unwrap();
        assert!(applied);

        let stale = fx
            .db
            .update_channel_status(d.id, Channel::Sms, ChannelStatus::Pending, ChannelStatus::Failed, None, at(3))
            .unwrap();
        assert!(!stale);

        let found = fx.db.find_delivery_by_provider_id(Channel::Sms, "SM1").unwrap().unwrap();
        assert_eq!(found.id, d.id);
        assert_eq!(found.sms.status, ChannelStatus::Sent);
        assert_eq!(found.sms.provider_message_id.as_deref(), Some("SM1"));
        assert_eq!(found.push.status, ChannelStatus::NotApplicable);
    }

    #[test]
    fn counters_follow_delivery_outcomes() {
        let fx = fixture();
        let alice = fx
            .db
            .insert_guest(NewGuest::new(fx.event.id, "Alice", "+15551111111"), at(0))
            .unwrap();
        let bob = fx
            .db
            .insert_guest(NewGuest::new(fx.event.id, "Bob", "+15552222222"), at(0))
            .unwrap();
        let msg = message(&fx, 1, MessageType::Announcement);
        fx.db
            .insert_deliveries(&[
                delivery(&msg, alice.id, ChannelStatus::Sent),
                delivery(&msg, bob.id, ChannelStatus::Failed),
            ])
            .unwrap();

        let stats = fx.db.recompute_message_counters(msg.id).unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);

        let stored = fx.db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored.delivered_count, 1);
        assert_eq!(stored.failed_count, 1);
    }

    #[test]
    fn inbox_only_returns_delivered_messages() {
        let fx = fixture();
        let alice = fx
            .db
            .insert_guest(NewGuest::new(fx.event.id, "Alice", "+15551111111"), at(0))
            .unwrap();
        let to_alice = message(&fx, 1, MessageType::Direct);
        let to_nobody = message(&fx, 2, MessageType::Direct);
        fx.db
            .insert_deliveries(&[delivery(&to_alice, alice.id, ChannelStatus::Pending)])
            .unwrap();

        let inbox = fx.db.list_inbox(alice.id, fx.event.id, None, 50).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_id, to_alice.id);
        assert_ne!(inbox[0].message_id, to_nobody.id);
        assert_eq!(inbox[0].sender_full_name.as_deref(), Some("Sarah Host"));
    }

    #[test]
    fn inbox_pages_descend_without_overlap() {
        let fx = fixture();
        let alice = fx
            .db
            .insert_guest(NewGuest::new(fx.event.id, "Alice", "+15551111111"), at(0))
            .unwrap();
        let mut sent = Vec::new();
        for minute in 1..=5 {
            let msg = message(&fx, minute, MessageType::Announcement);
            fx.db
                .insert_deliveries(&[delivery(&msg, alice.id, ChannelStatus::Sent)])
                .unwrap();
            sent.push(msg);
        }

        let first = fx.db.list_inbox(alice.id, fx.event.id, None, 2).unwrap();
        assert_eq!(first.iter().map(|e| e.message_id).collect::<Vec<_>>(), vec![sent[4].id, sent[3].id]);

        let last = &first[1];
        let key = InboxCursorKey {
            created_at: last.created_at,
            message_id: last.message_id,
        };
        let second = fx.db.list_inbox(alice.id, fx.event.id, Some(key), 2).unwrap();
        assert_eq!(second.iter().map(|e| e.message_id).collect::<Vec<_>>(), vec![sent[2].id, sent[1].id]);
        assert!(second.iter().all(|e| e.created_at < last.created_at));
    }
}
