//! Error taxonomy for the hub core.
//!
//! Only [`HubError::Decode`] ever reaches a client; everything else is logged
//! and either dropped or turned into connection teardown.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    /// The inbound frame was not a JSON envelope.
    #[error("malformed frame: {0}")]
    Decode(String),

    /// Well-formed envelope whose payload has the wrong shape for its action.
    #[error("invalid {action} payload: {reason}")]
    Validation { action: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("coordinator has stopped")]
    CoordinatorGone,

    #[error("connection {0} is already registered")]
    DuplicateConnection(String),
}

impl HubError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::Validation { .. } => "validation_error",
            Self::Transport(_) => "transport_error",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::WriteTimeout(_) => "write_timeout",
            Self::CoordinatorGone => "coordinator_gone",
            Self::DuplicateConnection(_) => "duplicate_connection",
        }
    }

    /// Whether this error ends the connection it happened on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::IdleTimeout(_) | Self::WriteTimeout(_) | Self::CoordinatorGone
        )
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(HubError::Decode("x".into()).error_code(), "decode_error");
        assert_eq!(
            HubError::IdleTimeout(Duration::from_secs(60)).error_code(),
            "idle_timeout"
        );
        assert_eq!(HubError::CoordinatorGone.error_code(), "coordinator_gone");
    }

    #[test]
    fn decode_and_validation_keep_connection_open() {
        assert!(!HubError::Decode("bad".into()).is_terminal());
        assert!(
            !HubError::Validation {
                action: "update_pos".into(),
                reason: "missing field".into(),
            }
            .is_terminal()
        );
        assert!(HubError::transport("reset").is_terminal());
        assert!(HubError::IdleTimeout(Duration::from_secs(60)).is_terminal());
    }

    #[test]
    fn display_includes_detail() {
        let err = HubError::Validation {
            action: "update_pos".into(),
            reason: "missing field `nick`".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid update_pos payload: missing field `nick`"
        );
    }
}
