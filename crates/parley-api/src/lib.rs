pub mod error;
pub mod messages;
pub mod middleware;
pub mod sessions;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use parley_gateway::RelayEngine;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: RelayEngine,
    pub jwt_secret: String,
}

/// Authenticated request/response surface for clients without a live
/// relay socket.
pub fn chat_routes(state: AppState) -> Router {
    Router::new()
        .route("/chat/session", get(sessions::get_session))
        .route("/chat/sessions", get(sessions::list_open_sessions))
        .route("/chat/session/{session_id}/message", post(messages::send_message))
        .route("/chat/session/{session_id}/history", get(messages::get_history))
        .route("/chat/session/{session_id}/close", post(sessions::close_session))
        .route("/chat/session/{session_id}/continue", post(sessions::continue_session))
        .route("/chat/messages/{message_id}/status", post(messages::update_status))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
