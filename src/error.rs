//! Error taxonomy for per-connection failures
//!
//! Everything here is recoverable: the affected client is rejected or
//! disconnected, other sessions are untouched. Only configuration errors are
//! process-fatal, and those stay plain `anyhow` errors at startup.

use std::time::Duration;
use thiserror::Error;

/// Rejection line for clients turned away by the concurrency limit
pub const LIMIT_REACHED_MESSAGE: &str = "Maximum connection-count reached. Try again later.\r\n";

/// Rejection line for clients whose backend could not be brought up.
/// Deliberately generic; diagnostics go to operator logs only.
pub const BACKEND_UNAVAILABLE_MESSAGE: &str = "Backend unavailable. Try again later.\r\n";

/// Why a connection could not be given a backend
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The per-image concurrency limit is exhausted
    #[error("image '{image}' is at its limit of {limit} concurrent instances")]
    LimitReached { image: String, limit: u32 },

    /// The runtime could not start or describe the backend
    #[error("failed to launch container for image '{image}': {reason}")]
    Launch { image: String, reason: anyhow::Error },

    /// The backend never served a byte within the readiness timeout
    #[error("container {container_id} for image '{image}' not ready after {timeout:?}")]
    ReadyTimeout {
        image: String,
        container_id: String,
        timeout: Duration,
    },

    /// No image section is registered for this listening port
    #[error("no image registered for port {0}")]
    UnknownPort(u16),
}

impl AcquireError {
    /// The single plaintext line written to the client before disconnecting
    pub fn client_message(&self) -> &'static str {
        match self {
            AcquireError::LimitReached { .. } => LIMIT_REACHED_MESSAGE,
            _ => BACKEND_UNAVAILABLE_MESSAGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_reached_client_message() {
        let err = AcquireError::LimitReached {
            image: "ssh".to_string(),
            limit: 3,
        };
        assert_eq!(err.client_message(), LIMIT_REACHED_MESSAGE);
        assert!(err.client_message().ends_with("\r\n"));
    }

    #[test]
    fn test_other_errors_share_generic_message() {
        let launch = AcquireError::Launch {
            image: "ssh".to_string(),
            reason: anyhow::anyhow!("no such image"),
        };
        let timeout = AcquireError::ReadyTimeout {
            image: "ssh".to_string(),
            container_id: "deadbeef".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(launch.client_message(), BACKEND_UNAVAILABLE_MESSAGE);
        assert_eq!(timeout.client_message(), BACKEND_UNAVAILABLE_MESSAGE);
        // The generic line must not leak backend diagnostics
        assert!(!launch.client_message().contains("image"));
    }

    #[test]
    fn test_display_names_the_image() {
        let err = AcquireError::LimitReached {
            image: "telnet".to_string(),
            limit: 1,
        };
        assert!(err.to_string().contains("telnet"));
        assert!(err.to_string().contains('1'));
    }
}
