use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use parley_types::events::{RelayCommand, RelayEvent};
use parley_types::models::Principal;

use crate::auth::verify_token;
use crate::error::RelayError;
use crate::presence::ConnectionId;
use crate::relay::RelayEngine;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket has to send `identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one relay socket from handshake to disconnect.
pub async fn handle_connection(socket: WebSocket, engine: RelayEngine, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let Some(principal) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("relay client failed to identify, closing");
        return;
    };

    // Step 2: Send Ready event
    let ready = RelayEvent::Ready {
        principal_id: principal.id,
        role: principal.role,
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (conn_id, events) = engine.presence().register(principal).await;
    let devices = engine.presence().connections_for_principal(principal.id).await.len();
    info!(%conn_id, principal_id = %principal.id, role = %principal.role, devices, "connected to relay");

    run_connection_loop(sender, receiver, engine.clone(), conn_id, principal, events).await;

    engine.disconnect(conn_id).await;
    info!(%conn_id, principal_id = %principal.id, "disconnected from relay");
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    engine: RelayEngine,
    conn_id: ConnectionId,
    principal: Principal,
    mut events: tokio::sync::mpsc::UnboundedReceiver<RelayEvent>,
) {
    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(%conn_id, "heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Commands from one socket are handled one at a time, in arrival order
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => handle_text(&engine, conn_id, principal, &text).await,
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Parse and run one text frame. Failures are reported back to `conn_id`.
async fn handle_text(engine: &RelayEngine, conn_id: ConnectionId, principal: Principal, text: &str) {
    match serde_json::from_str::<RelayCommand>(text) {
        Ok(cmd) => {
            let name = cmd.name();
            if let Err(err) = handle_command(engine, conn_id, principal, cmd).await {
                debug!(%conn_id, command = name, error = %err, "command rejected");
                reply_error(engine, conn_id, name, &err).await;
            }
        }
        Err(e) => {
            warn!(
                %conn_id,
                "bad command: {} -- raw: {}",
                e,
                text.chars().take(200).collect::<String>()
            );
            let err = RelayError::Validation(e.to_string());
            reply_error(engine, conn_id, "unknown", &err).await;
        }
    }
}

async fn handle_command(
    engine: &RelayEngine,
    conn_id: ConnectionId,
    principal: Principal,
    cmd: RelayCommand,
) -> Result<(), RelayError> {
    match cmd {
        RelayCommand::Identify { .. } => {} // Already handled

        RelayCommand::Join { room_id } => {
            engine.join(conn_id, principal, room_id).await?;
        }

        RelayCommand::Leave => {
            engine.leave(conn_id).await;
        }

        RelayCommand::Send { room_id, text } => {
            engine.send(Some(conn_id), principal, room_id, &text).await?;
        }

        RelayCommand::StatusUpdate { message_id, status } => {
            engine.update_status(principal, message_id, status).await?;
        }

        RelayCommand::Close { room_id } => {
            engine.close(principal, room_id).await?;
        }

        RelayCommand::Continue { room_id } => {
            engine.continue_session(principal, room_id).await?;
        }
    }

    Ok(())
}

/// Report a rejected command to the connection that sent it, and only there.
async fn reply_error(engine: &RelayEngine, conn_id: ConnectionId, command: &str, err: &RelayError) {
    let event = RelayEvent::Error {
        code: err.code().to_string(),
        message: err.to_string(),
        command: command.to_string(),
    };
    if let Err(e) = engine.presence().send_to(conn_id, event).await {
        let room_id = engine.presence().room_of(conn_id).await;
        warn!(%conn_id, room_id = ?room_id, command, error = %e, "could not report command error");
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RelayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("dropping unserializable event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Principal> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(RelayCommand::Identify { token }) = serde_json::from_str::<RelayCommand>(&text) {
                    return match verify_token(&token, jwt_secret) {
                        Ok(principal) => Some(principal),
                        Err(e) => {
                            warn!("identify rejected: {}", e);
                            None
                        }
                    };
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}
