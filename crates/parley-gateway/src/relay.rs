use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use parley_db::CommitGate;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::events::RelayEvent;
use parley_types::models::{ChatSession, Message, MessageStatus, Principal, Role};

use crate::error::RelayError;
use crate::presence::{ConnectionId, PresenceTracker};
use crate::store::ChatStore;

pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest accepted message body, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// Mediates all chat traffic: checks what a principal may do, writes through
/// the store, then fans the committed result out to the room.
///
/// Mutations of one room are serialized by a per-room lock that is held from
/// the durable write until the fan-out has been queued, so every connection
/// in a room sees events in commit order. Different rooms never contend.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    store: Arc<dyn ChatStore>,
    presence: PresenceTracker,
    room_locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    persist_timeout: Duration,
}

/// Held for the duration of a room mutation. Shared so that a store call the
/// caller stopped waiting for can keep the room locked until it returns.
type RoomGuard = Arc<OwnedMutexGuard<()>>;

impl RelayEngine {
    pub fn new(store: Arc<dyn ChatStore>, presence: PresenceTracker, persist_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                store,
                presence,
                room_locks: Mutex::new(HashMap::new()),
                persist_timeout,
            }),
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    // -- Sessions --

    /// The only way a session comes into existence. Admins do not own
    /// sessions and are refused.
    pub async fn get_or_create_session(&self, principal: Principal) -> Result<ChatSession, RelayError> {
        if principal.role != Role::Customer {
            return Err(RelayError::NotAuthorized);
        }

        let customer_id = principal.id;
        let existing = self
            .persist("find_session_by_customer", None, move |store, _| {
                store.find_session_by_customer(customer_id)
            })
            .await?;
        if let Some(session) = existing {
            return Ok(session);
        }

        let session = self
            .persist("create_session", None, move |store, _| {
                store.create_session_if_absent(Uuid::new_v4(), customer_id, Utc::now())
            })
            .await?;
        info!(session_id = %session.id, %customer_id, "chat session ready");
        Ok(session)
    }

    /// Messages in `room_id` after `after_seq`, oldest first.
    pub async fn history(
        &self,
        principal: Principal,
        room_id: Uuid,
        after_seq: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, RelayError> {
        let session = self.load_session(room_id).await?;
        authorize(&session, &principal)?;

        let after_seq = after_seq.unwrap_or(0).max(0);
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        self.persist("history", None, move |store, _| store.history(room_id, after_seq, limit))
            .await
    }

    /// Open sessions, most recently updated first. Admin only.
    pub async fn list_open_sessions(&self, principal: Principal) -> Result<Vec<ChatSession>, RelayError> {
        if !principal.is_admin() {
            return Err(RelayError::NotAuthorized);
        }
        self.persist("list_open_sessions", None, |store, _| store.list_open_sessions())
            .await
    }

    // -- Presence --

    /// Put a connection in a room. Customers may pass `None` to join their
    /// own session, which is created on first contact.
    pub async fn join(
        &self,
        conn_id: ConnectionId,
        principal: Principal,
        room_id: Option<Uuid>,
    ) -> Result<ChatSession, RelayError> {
        let session = match room_id {
            Some(room_id) => self.load_session(room_id).await?,
            None if principal.role == Role::Customer => self.get_or_create_session(principal).await?,
            None => return Err(RelayError::Validation("admins must name the room to join".into())),
        };
        authorize(&session, &principal)?;

        let ack = RelayEvent::Joined {
            session: session.clone(),
        };
        if !self.inner.presence.join_room(conn_id, session.id, Some(ack)).await {
            return Err(RelayError::NotFound("connection"));
        }
        let occupants = self.inner.presence.connections_in_room(session.id).await.len();
        info!(
            room_id = %session.id,
            %conn_id,
            principal_id = %principal.id,
            role = %principal.role,
            occupants,
            "joined room"
        );
        Ok(session)
    }

    /// Take a connection out of its room. Safe to repeat.
    pub async fn leave(&self, conn_id: ConnectionId) -> Option<Uuid> {
        let left = self.inner.presence.leave_room(conn_id).await;
        if let Some(room_id) = left {
            info!(%room_id, %conn_id, "left room");
        }
        left
    }

    /// Forget a connection entirely.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        self.inner.presence.unregister(conn_id).await;
    }

    // -- Mutations --

    /// Persist a message and fan it out to the room. Customers cannot send
    /// while the session is closed; admins always can.
    ///
    /// Nothing is fanned out unless the store write succeeded within the
    /// persist timeout.
    pub async fn send(
        &self,
        origin: Option<ConnectionId>,
        principal: Principal,
        room_id: Uuid,
        text: &str,
    ) -> Result<Message, RelayError> {
        let text = validate_text(text)?;

        let room = self.lock_room(room_id).await;
        let session = self.load_session(room_id).await?;
        authorize(&session, &principal)?;
        if session.is_closed && !principal.is_admin() {
            return Err(RelayError::SessionClosed);
        }

        let sender = principal.role;
        let message = self
            .persist("append_message", Some(&room), move |store, gate| {
                store.append_message(Uuid::new_v4(), room_id, sender, &text, Utc::now(), gate)
            })
            .await?;

        let delivered = self
            .inner
            .presence
            .broadcast_to_room(
                room_id,
                &RelayEvent::MessageReceived {
                    message: message.clone(),
                },
            )
            .await;
        let echoed = match origin {
            Some(conn_id) => self.inner.presence.is_in_room(conn_id, room_id).await,
            None => false,
        };
        debug!(
            %room_id,
            message_id = %message.id,
            seq = message.seq,
            sender = %sender,
            origin = ?origin,
            echoed,
            delivered,
            "message relayed"
        );

        Ok(message)
    }

    /// Advance a message's delivery status. Repeats and regressions are
    /// no-ops: the stored message is returned with `changed == false` and
    /// nothing is fanned out.
    pub async fn update_status(
        &self,
        principal: Principal,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<(Message, bool), RelayError> {
        if status == MessageStatus::Sent {
            return Err(RelayError::Validation("status must be delivered or read".into()));
        }

        let message = self.load_message(message_id).await?;
        let room_id = message.room_id;
        let session = self.load_session(room_id).await?;
        authorize(&session, &principal)?;

        let room = self.lock_room(room_id).await;

        // Compare-and-set loop. Each lost race means the stored status moved
        // forward, so this settles within a couple of rounds.
        loop {
            let current = self.load_message(message_id).await?;
            if current.status >= status {
                debug!(%message_id, current = %current.status, requested = %status, "status update ignored");
                return Ok((current, false));
            }

            let expected = current.status;
            let swapped = self
                .persist("compare_and_set_status", Some(&room), move |store, gate| {
                    store.compare_and_set_status(message_id, expected, status, gate)
                })
                .await?;
            if !swapped {
                continue;
            }

            let updated = Message { status, ..current };
            let delivered = self
                .inner
                .presence
                .broadcast_to_room(
                    room_id,
                    &RelayEvent::StatusUpdated {
                        room_id,
                        message_id,
                        status,
                    },
                )
                .await;
            debug!(%room_id, %message_id, %status, delivered, "status relayed");
            return Ok((updated, true));
        }
    }

    /// Close a session. Admin only. Closing a closed session succeeds and
    /// emits nothing.
    pub async fn close(&self, principal: Principal, room_id: Uuid) -> Result<(ChatSession, bool), RelayError> {
        if !principal.is_admin() {
            return Err(RelayError::NotAuthorized);
        }
        self.set_closed(principal, room_id, true).await
    }

    /// Reopen a session. Either side may do it. Continuing an open session
    /// succeeds and emits nothing.
    pub async fn continue_session(
        &self,
        principal: Principal,
        room_id: Uuid,
    ) -> Result<(ChatSession, bool), RelayError> {
        self.set_closed(principal, room_id, false).await
    }

    async fn set_closed(
        &self,
        principal: Principal,
        room_id: Uuid,
        closed: bool,
    ) -> Result<(ChatSession, bool), RelayError> {
        let room = self.lock_room(room_id).await;
        let session = self.load_session(room_id).await?;
        authorize(&session, &principal)?;

        if session.is_closed == closed {
            debug!(%room_id, closed, "session already in requested state");
            return Ok((session, false));
        }

        let changed = self
            .persist("set_session_closed", Some(&room), move |store, gate| {
                store.set_session_closed(room_id, closed, Utc::now(), gate)
            })
            .await?;
        let session = self.load_session(room_id).await?;

        if changed {
            let event = if closed {
                RelayEvent::SessionClosed { room_id }
            } else {
                RelayEvent::SessionContinued { room_id }
            };
            let delivered = self.inner.presence.broadcast_to_room(room_id, &event).await;
            info!(%room_id, closed, by = %principal.id, delivered, "session lifecycle changed");
        }

        Ok((session, changed))
    }

    // -- Internals --

    async fn load_session(&self, room_id: Uuid) -> Result<ChatSession, RelayError> {
        self.persist("find_session", None, move |store, _| store.find_session(room_id))
            .await?
            .ok_or(RelayError::NotFound("chat session"))
    }

    async fn load_message(&self, message_id: Uuid) -> Result<Message, RelayError> {
        self.persist("find_message", None, move |store, _| store.find_message(message_id))
            .await?
            .ok_or(RelayError::NotFound("message"))
    }

    async fn lock_room(&self, room_id: Uuid) -> RoomGuard {
        // The table only hands out Arcs, so a poisoned guard is still usable
        let lock = {
            let mut locks = self
                .inner
                .room_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(room_id).or_default().clone()
        };
        Arc::new(lock.lock_owned().await)
    }

    /// Run a blocking store call off the async runtime, bounded by the
    /// persist timeout.
    ///
    /// On timeout the call's commit gate is cancelled, so a write that has
    /// not committed yet rolls back instead. `room`, if given, stays locked
    /// until the abandoned call has actually returned. If the write had
    /// already started committing, its outcome is awaited and reported.
    async fn persist<T, F>(&self, op: &'static str, room: Option<&RoomGuard>, f: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ChatStore, &CommitGate) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.inner.store.clone();
        let gate = Arc::new(CommitGate::new());
        let task_gate = gate.clone();
        let mut task = tokio::task::spawn_blocking(move || f(&*store, &task_gate));

        let joined = match tokio::time::timeout(self.inner.persist_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.cancel() => {
                error!(op, timeout = ?self.inner.persist_timeout, "store call timed out");
                let room = room.cloned();
                tokio::spawn(async move {
                    let _room = room;
                    let _ = task.await;
                    debug!(op, "abandoned store call returned");
                });
                return Err(RelayError::Persistence(format!(
                    "{op} timed out after {:?}",
                    self.inner.persist_timeout
                )));
            }
            Err(_) => {
                warn!(op, timeout = ?self.inner.persist_timeout, "store call overran its timeout while committing");
                task.await
            }
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let detail = format!("{e:#}");
                error!(op, error = %detail, "store call failed");
                Err(RelayError::Persistence(detail))
            }
            Err(e) => {
                error!(op, error = %e, "store task failed");
                Err(RelayError::persistence(e))
            }
        }
    }
}

fn authorize(session: &ChatSession, principal: &Principal) -> Result<(), RelayError> {
    if session.is_participant(principal) {
        Ok(())
    } else {
        Err(RelayError::NotAuthorized)
    }
}

fn validate_text(text: &str) -> Result<String, RelayError> {
    if text.trim().is_empty() {
        return Err(RelayError::Validation("message text is empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(RelayError::Validation(format!(
            "message text exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{DateTime, Utc};
    use parley_db::Database;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Wraps the real database so individual writes can be made to fail or
    /// stall.
    struct FlakyStore {
        db: Database,
        fail_appends: AtomicBool,
        /// Stalls the next append only.
        append_delay: std::sync::Mutex<Option<Duration>>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                db: Database::open_in_memory().unwrap(),
                fail_appends: AtomicBool::new(false),
                append_delay: std::sync::Mutex::new(None),
            }
        }

        fn stalling(delay: Duration) -> Self {
            Self {
                append_delay: std::sync::Mutex::new(Some(delay)),
                ..Self::new()
            }
        }
    }

    impl ChatStore for FlakyStore {
        fn find_session(&self, id: Uuid) -> anyhow::Result<Option<ChatSession>> {
            ChatStore::find_session(&self.db, id)
        }

        fn find_session_by_customer(&self, customer_id: Uuid) -> anyhow::Result<Option<ChatSession>> {
            ChatStore::find_session_by_customer(&self.db, customer_id)
        }

        fn create_session_if_absent(
            &self,
            id: Uuid,
            customer_id: Uuid,
            now: DateTime<Utc>,
        ) -> anyhow::Result<ChatSession> {
            ChatStore::create_session_if_absent(&self.db, id, customer_id, now)
        }

        fn set_session_closed(
            &self,
            id: Uuid,
            closed: bool,
            now: DateTime<Utc>,
            gate: &CommitGate,
        ) -> anyhow::Result<bool> {
            ChatStore::set_session_closed(&self.db, id, closed, now, gate)
        }

        fn list_open_sessions(&self) -> anyhow::Result<Vec<ChatSession>> {
            ChatStore::list_open_sessions(&self.db)
        }

        fn append_message(
            &self,
            id: Uuid,
            room_id: Uuid,
            sender: Role,
            text: &str,
            now: DateTime<Utc>,
            gate: &CommitGate,
        ) -> anyhow::Result<Message> {
            let delay = self.append_delay.lock().unwrap().take();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            if self.fail_appends.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            ChatStore::append_message(&self.db, id, room_id, sender, text, now, gate)
        }

        fn find_message(&self, id: Uuid) -> anyhow::Result<Option<Message>> {
            ChatStore::find_message(&self.db, id)
        }

        fn compare_and_set_status(
            &self,
            id: Uuid,
            expected: MessageStatus,
            status: MessageStatus,
            gate: &CommitGate,
        ) -> anyhow::Result<bool> {
            ChatStore::compare_and_set_status(&self.db, id, expected, status, gate)
        }

        fn history(&self, room_id: Uuid, after_seq: i64, limit: u32) -> anyhow::Result<Vec<Message>> {
            ChatStore::history(&self.db, room_id, after_seq, limit)
        }
    }

    fn engine() -> RelayEngine {
        let store: Arc<dyn ChatStore> = Arc::new(Database::open_in_memory().unwrap());
        RelayEngine::new(store, PresenceTracker::new(), Duration::from_secs(2))
    }

    /// Register a connection for `principal`, join `room_id` and swallow the
    /// join acknowledgement.
    async fn connect(
        engine: &RelayEngine,
        principal: Principal,
        room_id: Uuid,
    ) -> (ConnectionId, UnboundedReceiver<RelayEvent>) {
        let (conn, mut rx) = engine.presence().register(principal).await;
        engine.join(conn, principal, Some(room_id)).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(RelayEvent::Joined { .. })));
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn customer_and_admin_conversation() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());

        let session = engine.get_or_create_session(customer).await.unwrap();
        assert!(!session.is_closed);

        let (_c, mut customer_rx) = connect(&engine, customer, session.id).await;
        let (_a, mut admin_rx) = connect(&engine, admin, session.id).await;

        let hello = engine.send(None, customer, session.id, "hello").await.unwrap();
        assert_eq!(hello.sender, Role::Customer);
        assert_eq!(hello.status, MessageStatus::Sent);
        for rx in [&mut customer_rx, &mut admin_rx] {
            assert_eq!(drain(rx), vec![RelayEvent::MessageReceived { message: hello.clone() }]);
        }

        let (read, changed) = engine
            .update_status(admin, hello.id, MessageStatus::Read)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(read.status, MessageStatus::Read);
        let status_event = RelayEvent::StatusUpdated {
            room_id: session.id,
            message_id: hello.id,
            status: MessageStatus::Read,
        };
        for rx in [&mut customer_rx, &mut admin_rx] {
            assert_eq!(drain(rx), vec![status_event.clone()]);
        }

        let (closed, changed) = engine.close(admin, session.id).await.unwrap();
        assert!(changed && closed.is_closed);
        for rx in [&mut customer_rx, &mut admin_rx] {
            assert_eq!(drain(rx), vec![RelayEvent::SessionClosed { room_id: session.id }]);
        }

        let err = engine
            .send(None, customer, session.id, "are you there?")
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::SessionClosed);
        assert!(drain(&mut customer_rx).is_empty());
        assert!(drain(&mut admin_rx).is_empty());

        let history = engine.history(admin, session.id, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn admin_may_send_into_closed_session() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        engine.close(admin, session.id).await.unwrap();

        let message = engine.send(None, admin, session.id, "we are closed").await.unwrap();
        assert_eq!(message.sender, Role::Admin);

        let stored = engine.get_or_create_session(customer).await.unwrap();
        assert_eq!(stored.latest_message_id, Some(message.id));
        assert!(stored.is_closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_arrive_in_commit_order_everywhere() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();

        let (_c, mut customer_rx) = connect(&engine, customer, session.id).await;
        let (_a, mut admin_rx) = connect(&engine, admin, session.id).await;

        let room_id = session.id;
        let mut tasks = Vec::new();
        for i in 0..20 {
            let engine = engine.clone();
            let principal = if i % 2 == 0 { customer } else { admin };
            tasks.push(tokio::spawn(async move {
                engine
                    .send(None, principal, room_id, &format!("message {i}"))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let seen_by = |rx: &mut UnboundedReceiver<RelayEvent>| -> Vec<(i64, Uuid)> {
            drain(rx)
                .into_iter()
                .map(|event| match event {
                    RelayEvent::MessageReceived { message } => (message.seq, message.id),
                    other => panic!("unexpected event {other:?}"),
                })
                .collect()
        };
        let customer_view = seen_by(&mut customer_rx);
        let admin_view = seen_by(&mut admin_rx);

        let history: Vec<(i64, Uuid)> = engine
            .history(admin, session.id, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.seq, m.id))
            .collect();

        assert_eq!(history.len(), 20);
        assert_eq!(customer_view, history);
        assert_eq!(admin_view, history);
        assert!(history.windows(2).all(|w| w[0].0 + 1 == w[1].0));
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let (_c, mut rx) = connect(&engine, customer, session.id).await;
        let message = engine.send(None, admin, session.id, "ping").await.unwrap();
        drain(&mut rx);

        let (_, changed) = engine.update_status(customer, message.id, MessageStatus::Read).await.unwrap();
        assert!(changed);
        let (after, changed) = engine
            .update_status(customer, message.id, MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(after.status, MessageStatus::Read);
        let (_, changed) = engine.update_status(customer, message.id, MessageStatus::Read).await.unwrap();
        assert!(!changed);

        // Only the first update fanned out
        assert_eq!(drain(&mut rx).len(), 1);

        let history = engine.history(customer, session.id, None, None).await.unwrap();
        assert_eq!(history[0].status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn status_update_rejects_sent_and_unknown_messages() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let message = engine.send(None, customer, session.id, "hi").await.unwrap();

        let err = engine
            .update_status(customer, message.id, MessageStatus::Sent)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let err = engine
            .update_status(customer, Uuid::new_v4(), MessageStatus::Read)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotFound("message"));

        let stranger = Principal::customer(Uuid::new_v4());
        let err = engine
            .update_status(stranger, message.id, MessageStatus::Read)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotAuthorized);
    }

    #[tokio::test]
    async fn close_and_continue_are_idempotent() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let (_c, mut rx) = connect(&engine, customer, session.id).await;

        let (first, changed_first) = engine.close(admin, session.id).await.unwrap();
        let (second, changed_second) = engine.close(admin, session.id).await.unwrap();
        assert!(changed_first);
        assert!(!changed_second);
        assert!(first.is_closed && second.is_closed);
        assert_eq!(drain(&mut rx), vec![RelayEvent::SessionClosed { room_id: session.id }]);

        let (reopened, changed) = engine.continue_session(customer, session.id).await.unwrap();
        assert!(changed && !reopened.is_closed);
        let (_, changed) = engine.continue_session(admin, session.id).await.unwrap();
        assert!(!changed);
        assert_eq!(drain(&mut rx), vec![RelayEvent::SessionContinued { room_id: session.id }]);
    }

    #[tokio::test]
    async fn lifecycle_permissions() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let stranger = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();

        assert_eq!(engine.close(customer, session.id).await.unwrap_err(), RelayError::NotAuthorized);
        assert_eq!(
            engine.continue_session(stranger, session.id).await.unwrap_err(),
            RelayError::NotAuthorized
        );
        assert_eq!(
            engine.close(Principal::admin(Uuid::new_v4()), Uuid::new_v4()).await.unwrap_err(),
            RelayError::NotFound("chat session")
        );
    }

    #[tokio::test]
    async fn failed_write_is_invisible() {
        let store = Arc::new(FlakyStore::new());
        let engine = RelayEngine::new(store.clone(), PresenceTracker::new(), Duration::from_secs(2));
        let customer = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let (_c, mut rx) = connect(&engine, customer, session.id).await;

        store.fail_appends.store(true, Ordering::SeqCst);
        let err = engine.send(None, customer, session.id, "lost").await.unwrap_err();

        assert_eq!(err.code(), "PERSISTENCE_ERROR");
        assert!(drain(&mut rx).is_empty());
        assert!(engine.history(customer, session.id, None, None).await.unwrap().is_empty());
        let session = engine.get_or_create_session(customer).await.unwrap();
        assert_eq!(session.latest_message_id, None);
    }

    #[tokio::test]
    async fn timed_out_write_never_commits() {
        let store = Arc::new(FlakyStore::stalling(Duration::from_millis(300)));
        let engine = RelayEngine::new(store, PresenceTracker::new(), Duration::from_millis(50));
        let customer = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let (_c, mut rx) = connect(&engine, customer, session.id).await;

        let err = engine.send(None, customer, session.id, "slow").await.unwrap_err();
        assert!(matches!(err, RelayError::Persistence(ref msg) if msg.contains("timed out")));

        // Outlive the stalled store call
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(drain(&mut rx).is_empty());
        assert!(engine.history(customer, session.id, None, None).await.unwrap().is_empty());
        let session = engine.get_or_create_session(customer).await.unwrap();
        assert_eq!(session.latest_message_id, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn room_stays_locked_until_timed_out_write_returns() {
        let stall = Duration::from_millis(300);
        let store = Arc::new(FlakyStore::stalling(stall));
        let engine = RelayEngine::new(store, PresenceTracker::new(), Duration::from_millis(100));
        let customer = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let (_c, mut rx) = connect(&engine, customer, session.id).await;

        let started = std::time::Instant::now();
        engine.send(None, customer, session.id, "slow").await.unwrap_err();
        let next = engine.send(None, customer, session.id, "next").await.unwrap();

        assert!(started.elapsed() >= stall);
        assert_eq!(next.seq, 1);
        assert_eq!(drain(&mut rx), vec![RelayEvent::MessageReceived { message: next.clone() }]);
        let history = engine.history(customer, session.id, None, None).await.unwrap();
        assert_eq!(history, vec![next]);
    }

    #[tokio::test]
    async fn join_rules() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());

        // Customers joining without a room land in their own, lazily created
        let (conn, mut rx) = engine.presence().register(customer).await;
        let session = engine.join(conn, customer, None).await.unwrap();
        assert_eq!(session.customer_id, customer.id);
        assert_eq!(drain(&mut rx), vec![RelayEvent::Joined { session: session.clone() }]);
        assert!(engine.presence().is_in_room(conn, session.id).await);

        let (admin_conn, _rx) = engine.presence().register(admin).await;
        let err = engine.join(admin_conn, admin, None).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let stranger = Principal::customer(Uuid::new_v4());
        let (stranger_conn, _rx) = engine.presence().register(stranger).await;
        let err = engine.join(stranger_conn, stranger, Some(session.id)).await.unwrap_err();
        assert_eq!(err, RelayError::NotAuthorized);
        assert!(!engine.presence().is_in_room(stranger_conn, session.id).await);

        let err = engine.join(admin_conn, admin, Some(Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err, RelayError::NotFound("chat session"));

        assert_eq!(engine.leave(conn).await, Some(session.id));
        assert_eq!(engine.leave(conn).await, None);
    }

    #[tokio::test]
    async fn every_device_of_a_principal_receives_messages() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        let (phone, mut phone_rx) = connect(&engine, customer, session.id).await;
        let (_laptop, mut laptop_rx) = connect(&engine, customer, session.id).await;

        let message = engine.send(None, customer, session.id, "from phone").await.unwrap();

        let expected = vec![RelayEvent::MessageReceived { message }];
        assert_eq!(drain(&mut phone_rx), expected);
        assert_eq!(drain(&mut laptop_rx), expected);

        // Disconnected devices simply stop receiving
        engine.disconnect(phone).await;
        engine.send(None, admin, session.id, "reply").await.unwrap();
        assert_eq!(drain(&mut laptop_rx).len(), 1);
        assert!(drain(&mut phone_rx).is_empty());
    }

    #[tokio::test]
    async fn send_validation() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();

        let err = engine.send(None, customer, session.id, "   ").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let too_long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        let err = engine.send(None, customer, session.id, &too_long).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let err = engine.send(None, customer, Uuid::new_v4(), "hi").await.unwrap_err();
        assert_eq!(err, RelayError::NotFound("chat session"));

        let stranger = Principal::customer(Uuid::new_v4());
        let err = engine.send(None, stranger, session.id, "hi").await.unwrap_err();
        assert_eq!(err, RelayError::NotAuthorized);
    }

    #[tokio::test]
    async fn session_queries() {
        let engine = engine();
        let first = Principal::customer(Uuid::new_v4());
        let second = Principal::customer(Uuid::new_v4());
        let admin = Principal::admin(Uuid::new_v4());

        let a = engine.get_or_create_session(first).await.unwrap();
        let again = engine.get_or_create_session(first).await.unwrap();
        assert_eq!(a.id, again.id);
        let b = engine.get_or_create_session(second).await.unwrap();

        assert_eq!(engine.get_or_create_session(admin).await.unwrap_err(), RelayError::NotAuthorized);
        assert_eq!(engine.list_open_sessions(first).await.unwrap_err(), RelayError::NotAuthorized);

        engine.send(None, first, a.id, "bump").await.unwrap();
        let open: Vec<Uuid> = engine
            .list_open_sessions(admin)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(open, vec![a.id, b.id]);

        engine.close(admin, a.id).await.unwrap();
        let open = engine.list_open_sessions(admin).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b.id);

        assert_eq!(
            engine.history(second, a.id, None, None).await.unwrap_err(),
            RelayError::NotAuthorized
        );
    }

    #[tokio::test]
    async fn history_pages_by_sequence() {
        let engine = engine();
        let customer = Principal::customer(Uuid::new_v4());
        let session = engine.get_or_create_session(customer).await.unwrap();
        for i in 0..5 {
            engine.send(None, customer, session.id, &format!("m{i}")).await.unwrap();
        }

        let page = engine.history(customer, session.id, Some(2), Some(2)).await.unwrap();
        let texts: Vec<&str> = page.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3"]);
    }
}
