use thiserror::Error;

/// Why a relay operation was rejected.
///
/// Everything except `Persistence` is reported to the caller before any
/// state changes. `Transport` never reaches a caller: it describes a single
/// fan-out target that could not be reached and is only logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("principal is not allowed to do this")]
    NotAuthorized,

    #[error("chat session is closed")]
    SessionClosed,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("transport failed: {0}")]
    Transport(String),
}

impl RelayError {
    /// Stable wire code carried in error events and HTTP bodies.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}
