use anyhow::{Result, bail};
use rusqlite::params;
use uuid::Uuid;

use unveil_types::Message;
use unveil_types::stats::DeliveryStats;

use crate::Database;
use crate::convert::ts;
use crate::models::{DELIVERY_COLUMNS, DeliveryRow, MESSAGE_COLUMNS, MessageRow};
use crate::queries::OptionalExt;

impl Database {
    // -- Messages --

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, event_id, sender_user_id, content, message_type,
                                       scheduled_message_id, delivered_count, failed_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.id.to_string(),
                    message.event_id.to_string(),
                    message.sender_user_id.to_string(),
                    message.content,
                    message.message_type.as_str(),
                    message.scheduled_message_id.map(|id| id.to_string()),
                    message.delivered_count,
                    message.failed_count,
                    ts(message.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id.to_string()],
                MessageRow::from_row,
            )
            .optional()
        })?;
        row.map(MessageRow::into_message).transpose()
    }

    /// Recompute `delivered_count` / `failed_count` from the message's
    /// deliveries. Read and write happen in one transaction so two
    /// concurrent recomputes cannot interleave a stale tally.
    pub fn recompute_message_counters(&self, message_id: Uuid) -> Result<DeliveryStats> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE message_id = ?1"
                ))?;
                stmt.query_map([message_id.to_string()], DeliveryRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let deliveries = rows
                .into_iter()
                .map(DeliveryRow::into_delivery)
                .collect::<Result<Vec<_>>>()?;
            let stats = DeliveryStats::tally(&deliveries);

            let changed = tx.execute(
                "UPDATE messages SET delivered_count = ?1, failed_count = ?2 WHERE id = ?3",
                params![stats.delivered, stats.failed, message_id.to_string()],
            )?;
            if changed == 0 {
                bail!("Message not found: {}", message_id);
            }
            tx.commit()?;
            Ok(stats)
        })
    }
}
