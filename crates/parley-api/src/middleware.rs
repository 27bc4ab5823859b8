use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use parley_gateway::auth::verify_token;

use crate::AppState;
use crate::error::ApiError;

/// Extract and validate the bearer token, then hand the handler a
/// `Principal` extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthenticated)?;

    let principal = verify_token(token, &state.jwt_secret).map_err(|e| {
        debug!("rejected bearer token: {}", e);
        ApiError::Unauthenticated
    })?;

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
