use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chat_sessions (
            id                  TEXT PRIMARY KEY,
            customer_id         TEXT NOT NULL UNIQUE,
            is_closed           INTEGER NOT NULL DEFAULT 0,
            latest_message_id   TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_sessions_open
            ON chat_sessions(is_closed, updated_at);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            room_id     TEXT NOT NULL REFERENCES chat_sessions(id),
            seq         INTEGER NOT NULL,
            sender      TEXT NOT NULL CHECK (sender IN ('customer', 'admin')),
            text        TEXT NOT NULL CHECK (length(text) > 0),
            status      TEXT NOT NULL CHECK (status IN ('sent', 'delivered', 'read')),
            created_at  TEXT NOT NULL,
            UNIQUE(room_id, seq)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
