use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::{SendMessageRequest, StatusResponse, UpdateStatusRequest};
use parley_types::models::Principal;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Only return messages after this room position.
    pub after_seq: Option<i64>,
    pub limit: Option<u32>,
}

/// POST /chat/session/{id}/message: same path as a socket `send`, so every
/// joined connection sees the message.
pub async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .engine
        .send(None, principal, session_id, &req.text)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .engine
        .history(principal, session_id, query.after_seq, query.limit)
        .await?;
    Ok(Json(messages))
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (message, changed) = state
        .engine
        .update_status(principal, message_id, req.status)
        .await?;
    Ok(Json(StatusResponse { message, changed }))
}
