//! Error codes reported by a session document gateway.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings (e.g. `"PERMISSION_DENIED"`)
//! inside gateway `Error` and `WriteRejected` frames.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by a session document backend.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation
/// and [`is_transient()`](ErrorCode::is_transient) to decide whether the next user
/// action may succeed without intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Identity
    Unauthenticated,
    PermissionDenied,

    // Writes
    InvalidPatch,
    DocumentTooLarge,

    // Rate limiting
    ResourceExhausted,

    // Backend
    Unavailable,
    DeadlineExceeded,
    InternalError,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthenticated => {
                "The session subscription requires a signed-in user. Sign in to synchronize devices."
            }
            Self::PermissionDenied => {
                "This user is not allowed to read or write the requested session document."
            }
            Self::InvalidPatch => {
                "The partial write contained fields or values the backend does not accept."
            }
            Self::DocumentTooLarge => {
                "The session document would exceed the backend's size limit after this write."
            }
            Self::ResourceExhausted => {
                "Too many writes in a short time. Slow down and try again."
            }
            Self::Unavailable => {
                "The backend is temporarily unavailable. Local state stays authoritative until it returns."
            }
            Self::DeadlineExceeded => "The backend did not answer in time.",
            Self::InternalError => "The backend failed while processing the request.",
        }
    }

    /// Returns `true` for codes that describe a temporary backend condition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted | Self::Unavailable | Self::DeadlineExceeded
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::PermissionDenied).unwrap();
        assert_eq!(json, "\"PERMISSION_DENIED\"");
        let back: ErrorCode = serde_json::from_str("\"RESOURCE_EXHAUSTED\"").unwrap();
        assert_eq!(back, ErrorCode::ResourceExhausted);
    }

    #[test]
    fn transient_codes() {
        assert!(ErrorCode::Unavailable.is_transient());
        assert!(!ErrorCode::PermissionDenied.is_transient());
    }
}
