use anyhow::{Result, bail};
use rusqlite::{Connection, params};
use uuid::Uuid;

use unveil_types::display::resolve_display_name;
use unveil_types::{Event, User};

use crate::Database;
use crate::convert::ts;
use crate::models::{EVENT_COLUMNS, EventRow, USER_COLUMNS, UserRow};
use crate::queries::OptionalExt;

impl Database {
    // -- Users --

    pub fn create_user(&self, user: &User) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, full_name, phone, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user.id.to_string(), user.full_name, user.phone, ts(user.created_at)],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id.to_string()],
                UserRow::from_row,
            )
            .optional()
        })?;
        row.map(UserRow::into_user).transpose()
    }

    /// Rename an account. Every guest row linked to it gets its cached
    /// display name recomputed in the same transaction.
    /// Returns the number of guest rows refreshed.
    pub fn update_user_name(&self, user_id: Uuid, full_name: Option<&str>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE users SET full_name = ?1 WHERE id = ?2",
                params![full_name, user_id.to_string()],
            )?;
            if changed == 0 {
                bail!("User not found: {}", user_id);
            }
            let refreshed = refresh_display_names(&tx, "g.user_id = ?1", &user_id.to_string())?;
            tx.commit()?;
            Ok(refreshed)
        })
    }

    // -- Events --

    pub fn create_event(&self, event: &Event) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (id, title, host_user_id, sms_tag, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_string(),
                    event.title,
                    event.host_user_id.to_string(),
                    event.sms_tag,
                    ts(event.created_at)
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [id.to_string()],
                EventRow::from_row,
            )
            .optional()
        })?;
        row.map(EventRow::into_event).transpose()
    }
}

/// Recompute `guests.display_name` for the guests matched by `predicate`
/// (written against alias `g`, with one `?1` parameter).
pub(crate) fn refresh_display_names(conn: &Connection, predicate: &str, param: &str) -> Result<usize> {
    let mut stmt = conn.prepare(&format!(
        "SELECT g.id, g.guest_name, u.full_name
         FROM guests g
         LEFT JOIN users u ON u.id = g.user_id
         WHERE {predicate}"
    ))?;
    let rows = stmt
        .query_map([param], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (guest_id, guest_name, full_name) in &rows {
        let display = resolve_display_name(full_name.as_deref(), guest_name.as_deref());
        conn.execute(
            "UPDATE guests SET display_name = ?1 WHERE id = ?2",
            params![display, guest_id],
        )?;
    }

    Ok(rows.len())
}
