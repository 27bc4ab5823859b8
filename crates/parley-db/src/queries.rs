use crate::Database;
use crate::gate::CommitGate;
use crate::models::{MessageRow, SessionRow};
use anyhow::{Result, bail};
use rusqlite::{Connection, OptionalExtension, Row};

const SESSION_COLUMNS: &str =
    "id, customer_id, is_closed, latest_message_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, room_id, seq, sender, text, status, created_at";

/// Fields for a message that has not been assigned a room position yet.
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub room_id: &'a str,
    pub sender: &'a str,
    pub text: &'a str,
    pub status: &'a str,
    pub created_at: &'a str,
}

impl Database {
    // -- Chat sessions --

    pub fn find_session(&self, id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| query_session(conn, "id", id))
    }

    pub fn find_session_by_customer(&self, customer_id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| query_session(conn, "customer_id", customer_id))
    }

    /// Insert a session for `customer_id` unless one already exists, then
    /// return whichever row is stored. `customer_id` is UNIQUE, so racing
    /// callers all end up with the same session.
    pub fn create_session_if_absent(
        &self,
        id: &str,
        customer_id: &str,
        now: &str,
    ) -> Result<SessionRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO chat_sessions (id, customer_id, is_closed, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                (id, customer_id, now),
            )?;

            match query_session(conn, "customer_id", customer_id)? {
                Some(row) => Ok(row),
                None => bail!("session for customer {} vanished after insert", customer_id),
            }
        })
    }

    /// Flip the closed flag. Returns false when the session was already in
    /// the requested state (or does not exist).
    pub fn set_session_closed(
        &self,
        id: &str,
        closed: bool,
        now: &str,
        gate: &CommitGate,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            if !gate.try_commit() {
                bail!("close flag update for {} cancelled", id);
            }
            let changed = conn.execute(
                "UPDATE chat_sessions SET is_closed = ?2, updated_at = ?3
                 WHERE id = ?1 AND is_closed != ?2",
                rusqlite::params![id, closed, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// Open sessions, most recently updated first.
    pub fn list_open_sessions(&self) -> Result<Vec<SessionRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM chat_sessions
                 WHERE is_closed = 0
                 ORDER BY updated_at DESC, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], session_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Append a message to its room and point the session at it, in one
    /// transaction. The room position is `max(seq) + 1`. Rolls back instead
    /// of committing if `gate` was cancelled meanwhile.
    pub fn append_message(&self, msg: &NewMessage<'_>, gate: &CommitGate) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE room_id = ?1",
                [msg.room_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (id, room_id, seq, sender, text, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.id,
                    msg.room_id,
                    seq,
                    msg.sender,
                    msg.text,
                    msg.status,
                    msg.created_at
                ],
            )?;

            let updated = tx.execute(
                "UPDATE chat_sessions SET latest_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                (msg.room_id, msg.id, msg.created_at),
            )?;
            if updated != 1 {
                // Dropping the transaction rolls the insert back
                bail!("chat session {} not found", msg.room_id);
            }

            if !gate.try_commit() {
                bail!("append of message {} cancelled before commit", msg.id);
            }
            tx.commit()?;

            Ok(MessageRow {
                id: msg.id.to_string(),
                room_id: msg.room_id.to_string(),
                seq,
                sender: msg.sender.to_string(),
                text: msg.text.to_string(),
                status: msg.status.to_string(),
                created_at: msg.created_at.to_string(),
            })
        })
    }

    pub fn find_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
            let row = conn.query_row(&sql, [id], message_from_row).optional()?;
            Ok(row)
        })
    }

    /// Set `status` only if the stored value still equals `expected`.
    /// Returns whether the write happened.
    pub fn compare_and_set_status(
        &self,
        id: &str,
        expected: &str,
        status: &str,
        gate: &CommitGate,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            if !gate.try_commit() {
                bail!("status update of message {} cancelled", id);
            }
            let changed = conn.execute(
                "UPDATE messages SET status = ?3 WHERE id = ?1 AND status = ?2",
                (id, expected, status),
            )?;
            Ok(changed > 0)
        })
    }

    /// Messages in a room with `seq > after_seq`, ascending.
    pub fn get_history(&self, room_id: &str, after_seq: i64, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![room_id, after_seq, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_session(conn: &Connection, column: &str, value: &str) -> Result<Option<SessionRow>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE {column} = ?1");
    let row = conn.query_row(&sql, [value], session_from_row).optional()?;
    Ok(row)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        is_closed: row.get(2)?,
        latest_message_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        seq: row.get(2)?,
        sender: row.get(3)?,
        text: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
    })
}
