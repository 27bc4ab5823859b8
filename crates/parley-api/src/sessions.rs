use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::LifecycleResponse;
use parley_types::models::Principal;

use crate::AppState;
use crate::error::ApiError;

/// GET /chat/session: the caller's own session, created on first contact.
pub async fn get_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.engine.get_or_create_session(principal).await?;
    Ok(Json(session))
}

/// GET /chat/sessions: open sessions for the admin inbox.
pub async fn list_open_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.engine.list_open_sessions(principal).await?;
    Ok(Json(sessions))
}

pub async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, changed) = state.engine.close(principal, session_id).await?;
    Ok(Json(LifecycleResponse { session, changed }))
}

pub async fn continue_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, changed) = state.engine.continue_session(principal, session_id).await?;
    Ok(Json(LifecycleResponse { session, changed }))
}
