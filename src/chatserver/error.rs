// Error taxonomy for the chat server

use thiserror::Error;

/// Errors produced by the chat server core.
///
/// Store failures are always surfaced to the caller (message loss is
/// user-visible data loss); presence failures are logged and degraded to
/// "offline" without ever reaching the user.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No valid session at connect time, or an event arrived before auth.
    #[error("not authenticated")]
    Unauthenticated,

    /// Malformed event: missing receiver, empty content, self-send, etc.
    /// Dropped without persistence.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Persistence backend failure.
    #[error("store unavailable: {0}")]
    Store(#[from] rusqlite::Error),

    /// Presence backend failure. Degrades delivery, never blocks persistence.
    #[error("presence unavailable: {0}")]
    Presence(String),

    /// Referenced row does not exist.
    #[error("not found")]
    NotFound,

    /// Caller is not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Whether the error should be reported back over the live channel.
    /// Presence failures are internal only.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, ChatError::Presence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_errors_stay_internal() {
        assert!(!ChatError::Presence("down".into()).is_user_visible());
        assert!(ChatError::Unauthenticated.is_user_visible());
        assert!(ChatError::Validation("empty content".into()).is_user_visible());
    }
}
