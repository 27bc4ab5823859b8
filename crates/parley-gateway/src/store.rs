//! The relay's view of durable storage.
//!
//! The relay only talks to [`ChatStore`]; `parley_db::Database` is the
//! production implementation. Calls are blocking and are driven from
//! `spawn_blocking` by the relay.
//!
//! Writes that get fanned out take a [`CommitGate`]. Such a write must not
//! become durable once the relay has cancelled its gate; that is how a
//! timed-out call is kept from committing after the caller gave up.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_db::{CommitGate, Database};
use parley_db::models::{MessageRow, SessionRow};
use parley_db::queries::NewMessage;
use parley_types::models::{ChatSession, Message, MessageStatus, Role};

pub trait ChatStore: Send + Sync + 'static {
    fn find_session(&self, id: Uuid) -> Result<Option<ChatSession>>;

    fn find_session_by_customer(&self, customer_id: Uuid) -> Result<Option<ChatSession>>;

    /// Returns the customer's session, inserting `id` if they have none.
    fn create_session_if_absent(
        &self,
        id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChatSession>;

    /// Returns true if the flag actually changed.
    fn set_session_closed(
        &self,
        id: Uuid,
        closed: bool,
        now: DateTime<Utc>,
        gate: &CommitGate,
    ) -> Result<bool>;

    fn list_open_sessions(&self) -> Result<Vec<ChatSession>>;

    /// Persists a `sent` message and moves the session's latest-message
    /// pointer to it. Either both happen or neither does.
    fn append_message(
        &self,
        id: Uuid,
        room_id: Uuid,
        sender: Role,
        text: &str,
        now: DateTime<Utc>,
        gate: &CommitGate,
    ) -> Result<Message>;

    fn find_message(&self, id: Uuid) -> Result<Option<Message>>;

    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: MessageStatus,
        status: MessageStatus,
        gate: &CommitGate,
    ) -> Result<bool>;

    fn history(&self, room_id: Uuid, after_seq: i64, limit: u32) -> Result<Vec<Message>>;
}

impl ChatStore for Database {
    fn find_session(&self, id: Uuid) -> Result<Option<ChatSession>> {
        Database::find_session(self, &id.to_string())?
            .map(session_from_row)
            .transpose()
    }

    fn find_session_by_customer(&self, customer_id: Uuid) -> Result<Option<ChatSession>> {
        Database::find_session_by_customer(self, &customer_id.to_string())?
            .map(session_from_row)
            .transpose()
    }

    fn create_session_if_absent(
        &self,
        id: Uuid,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let row = Database::create_session_if_absent(
            self,
            &id.to_string(),
            &customer_id.to_string(),
            &timestamp(now),
        )?;
        session_from_row(row)
    }

    fn set_session_closed(
        &self,
        id: Uuid,
        closed: bool,
        now: DateTime<Utc>,
        gate: &CommitGate,
    ) -> Result<bool> {
        Database::set_session_closed(self, &id.to_string(), closed, &timestamp(now), gate)
    }

    fn list_open_sessions(&self) -> Result<Vec<ChatSession>> {
        Database::list_open_sessions(self)?
            .into_iter()
            .map(session_from_row)
            .collect()
    }

    fn append_message(
        &self,
        id: Uuid,
        room_id: Uuid,
        sender: Role,
        text: &str,
        now: DateTime<Utc>,
        gate: &CommitGate,
    ) -> Result<Message> {
        let id = id.to_string();
        let room_id = room_id.to_string();
        let created_at = timestamp(now);
        let row = Database::append_message(
            self,
            &NewMessage {
                id: &id,
                room_id: &room_id,
                sender: sender.as_str(),
                text,
                status: MessageStatus::Sent.as_str(),
                created_at: &created_at,
            },
            gate,
        )?;
        message_from_row(row)
    }

    fn find_message(&self, id: Uuid) -> Result<Option<Message>> {
        Database::find_message(self, &id.to_string())?
            .map(message_from_row)
            .transpose()
    }

    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: MessageStatus,
        status: MessageStatus,
        gate: &CommitGate,
    ) -> Result<bool> {
        Database::compare_and_set_status(
            self,
            &id.to_string(),
            expected.as_str(),
            status.as_str(),
            gate,
        )
    }

    fn history(&self, room_id: Uuid, after_seq: i64, limit: u32) -> Result<Vec<Message>> {
        Database::get_history(self, &room_id.to_string(), after_seq, limit)?
            .into_iter()
            .map(message_from_row)
            .collect()
    }
}

/// RFC 3339 with fixed microsecond precision, so stored strings sort the
/// same way the instants do.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp '{raw}'"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{raw}'"))
}

fn session_from_row(row: SessionRow) -> Result<ChatSession> {
    Ok(ChatSession {
        id: parse_id(&row.id)?,
        customer_id: parse_id(&row.customer_id)?,
        is_closed: row.is_closed,
        latest_message_id: row.latest_message_id.as_deref().map(parse_id).transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}

fn message_from_row(row: MessageRow) -> Result<Message> {
    Ok(Message {
        id: parse_id(&row.id)?,
        room_id: parse_id(&row.room_id)?,
        seq: row.seq,
        sender: row
            .sender
            .parse()
            .with_context(|| format!("corrupt sender on message {}", row.id))?,
        text: row.text,
        status: row
            .status
            .parse()
            .with_context(|| format!("corrupt status on message {}", row.id))?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
