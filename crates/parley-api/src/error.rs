use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use parley_gateway::RelayError;
use parley_types::api::{ErrorBody, ErrorDetail};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthenticated,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Relay(err) => match err {
                RelayError::NotAuthorized => StatusCode::FORBIDDEN,
                RelayError::SessionClosed => StatusCode::CONFLICT,
                RelayError::NotFound(_) => StatusCode::NOT_FOUND,
                RelayError::Validation(_) => StatusCode::BAD_REQUEST,
                RelayError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
                RelayError::Transport(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Relay(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}
