use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        // Timestamps are RFC 3339 UTC with fixed microsecond precision so
        // that text order equals time order (keyset pagination relies on it).
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                full_name   TEXT,
                phone       TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE events (
                id            TEXT PRIMARY KEY,
                title         TEXT NOT NULL,
                host_user_id  TEXT NOT NULL REFERENCES users(id),
                sms_tag       TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE guests (
                id                TEXT PRIMARY KEY,
                event_id          TEXT NOT NULL REFERENCES events(id),
                user_id           TEXT REFERENCES users(id),
                guest_name        TEXT,
                display_name      TEXT NOT NULL,
                phone             TEXT NOT NULL DEFAULT '',
                email             TEXT,
                sms_opt_out       INTEGER NOT NULL DEFAULT 0,
                rsvp_status       TEXT NOT NULL DEFAULT 'pending',
                declined_at       TEXT,
                removed_at        TEXT,
                tags              TEXT NOT NULL DEFAULT '[]',
                first_contact_at  TEXT,
                created_at        TEXT NOT NULL
            );

            CREATE INDEX idx_guests_event ON guests(event_id);
            CREATE INDEX idx_guests_user ON guests(user_id);

            CREATE TABLE scheduled_messages (
                id                    TEXT PRIMARY KEY,
                event_id              TEXT NOT NULL REFERENCES events(id),
                sender_user_id        TEXT NOT NULL REFERENCES users(id),
                content               TEXT NOT NULL,
                message_type          TEXT NOT NULL,
                target_kind           TEXT NOT NULL,
                target_guest_ids      TEXT,
                target_tags           TEXT,
                require_all_tags      INTEGER NOT NULL DEFAULT 0,
                target_rsvp_statuses  TEXT,
                include_declined      INTEGER NOT NULL DEFAULT 0,
                send_via_sms          INTEGER NOT NULL DEFAULT 0,
                send_via_push         INTEGER NOT NULL DEFAULT 0,
                send_via_email        INTEGER NOT NULL DEFAULT 0,
                send_at               TEXT NOT NULL,
                recipient_count       INTEGER NOT NULL DEFAULT 0 CHECK (recipient_count >= 0),
                status                TEXT NOT NULL DEFAULT 'scheduled'
                    CHECK (status IN ('scheduled', 'sending', 'sent', 'failed', 'cancelled')),
                created_at            TEXT NOT NULL,
                claimed_at            TEXT,
                processed_at          TEXT,
                failure_reason        TEXT,
                message_id            TEXT,
                success_count         INTEGER NOT NULL DEFAULT 0 CHECK (success_count >= 0),
                failure_count         INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0)
            );

            CREATE INDEX idx_scheduled_due ON scheduled_messages(status, send_at);
            CREATE INDEX idx_scheduled_event ON scheduled_messages(event_id, send_at);

            CREATE TABLE messages (
                id                    TEXT PRIMARY KEY,
                event_id              TEXT NOT NULL REFERENCES events(id),
                sender_user_id        TEXT NOT NULL REFERENCES users(id),
                content               TEXT NOT NULL,
                message_type          TEXT NOT NULL,
                scheduled_message_id  TEXT REFERENCES scheduled_messages(id),
                delivered_count       INTEGER NOT NULL DEFAULT 0 CHECK (delivered_count >= 0),
                failed_count          INTEGER NOT NULL DEFAULT 0 CHECK (failed_count >= 0),
                created_at            TEXT NOT NULL
            );

            CREATE INDEX idx_messages_event ON messages(event_id, created_at, id);

            CREATE TABLE deliveries (
                id                   TEXT PRIMARY KEY,
                message_id           TEXT NOT NULL REFERENCES messages(id),
                guest_id             TEXT NOT NULL REFERENCES guests(id),
                user_id              TEXT,
                phone                TEXT NOT NULL DEFAULT '',
                sms_status           TEXT NOT NULL DEFAULT 'not_applicable',
                sms_provider_id      TEXT,
                push_status          TEXT NOT NULL DEFAULT 'not_applicable',
                push_provider_id     TEXT,
                email_status         TEXT NOT NULL DEFAULT 'not_applicable',
                email_provider_id    TEXT,
                has_responded        INTEGER NOT NULL DEFAULT 0,
                response_message_id  TEXT REFERENCES messages(id),
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                UNIQUE(message_id, guest_id)
            );

            CREATE INDEX idx_deliveries_guest ON deliveries(guest_id, message_id);
            CREATE INDEX idx_deliveries_sms_provider ON deliveries(sms_provider_id);
            CREATE INDEX idx_deliveries_push_provider ON deliveries(push_provider_id);
            CREATE INDEX idx_deliveries_email_provider ON deliveries(email_provider_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
