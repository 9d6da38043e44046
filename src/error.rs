// Error taxonomy shared by the backend, token provider, channel and sync actor.
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The session needs an interactive re-login. Surfaced, never retried.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Transport failure or server-side (5xx) error. Transient.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 4xx-class application error, permanent for this request.
    #[error("Rejected by backend ({status}): {message}")]
    RejectedByBackend { status: u16, message: String },

    /// A completion arrived for a selection that has since been reversed.
    #[error("Stale result for calendar {0}")]
    StaleResult(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Real-time channel closed")]
    ChannelClosed,
}

impl SyncError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        SyncError::RejectedByBackend {
            status,
            message: message.into(),
        }
    }

    /// Transient errors leave local state unchanged and wait for the next scheduled action.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::BackendUnavailable(_))
    }

    /// Errors the user must see. Stale results and transient failures are not among them.
    pub fn is_escalated(&self) -> bool {
        matches!(
            self,
            SyncError::AuthExpired(_) | SyncError::RejectedByBackend { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidPayload(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
