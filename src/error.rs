use crate::store::StoreError;
use crate::types::{SessionCode, SessionStatus, SESSIONS_PREFIX};

/// Result type for duel operations
pub type DuelResult<T> = Result<T, DuelError>;

/// Errors surfaced to the lobby/UI layer. None of them is fatal; the caller
/// goes back to the directory and lets the user retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DuelError {
    #[error("Session {0} not found")]
    SessionNotFound(SessionCode),

    #[error("Session {code} is no longer joinable (status: {status:?})")]
    SessionNotJoinable {
        code: SessionCode,
        status: SessionStatus,
    },

    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed session code: {0}")]
    MalformedCode(String),

    #[error("At least one operation must be allowed")]
    NoOperations,

    #[error("All session codes are in use")]
    CodeSpaceExhausted,

    #[error("Only the host can {0}")]
    NotHost(&'static str),

    #[error("{0}")]
    InvalidState(String),

    #[error("Session has already been left")]
    SessionClosed,
}

impl From<StoreError> for DuelError {
    fn from(err: StoreError) -> Self {
        if let StoreError::NotFound(key) = &err {
            let code = key
                .strip_prefix(SESSIONS_PREFIX)
                .and_then(|raw| SessionCode::parse(raw).ok());
            if let Some(code) = code {
                return DuelError::SessionNotFound(code);
            }
        }
        DuelError::StoreUnavailable(err.to_string())
    }
}
