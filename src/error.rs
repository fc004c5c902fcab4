//! Error types for the ingestion-and-relay pipeline.
//!
//! Every component boundary returns [`BridgeError`]. The relay loop uses the
//! classification helpers to decide what a failure costs:
//!
//! - **Startup errors** ([`BridgeError::is_startup_fatal`]): bad frame length,
//!   unusable secret key, invalid configuration. The process refuses to start.
//! - **Connection errors** ([`BridgeError::is_connection_fatal`]): the inbound
//!   peer is gone or the byte stream lost alignment. The socket is closed and
//!   the relay waits for the next sensor.
//! - **Frame errors**: everything else. The frame is dropped, streaming goes on.
//!
//! ```rust
//! use ecg_bridge::BridgeError;
//!
//! let error = BridgeError::connection_closed(3, 8);
//! assert!(error.is_connection_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Peer closed the connection after {received} of {expected} frame bytes")]
    ConnectionClosed { received: usize, expected: usize },

    #[error("No data within {duration:?} ({discarded} partial bytes discarded)")]
    ReadTimeout { duration: Duration, discarded: usize },

    #[error("Frame length {length} is invalid: must be a positive even number of bytes")]
    MalformedFrameLength { length: usize },

    #[error("Secret key is unusable: {reason}")]
    InvalidKey { reason: String },

    #[error("Publish did not complete within {duration:?}")]
    PublishTimeout { duration: Duration },

    #[error("Broker rejected publish: {reason}")]
    PublishRejected {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Credential expired at {expired_at} (epoch seconds)")]
    CredentialExpired { expired_at: u64 },

    #[error("Invalid configuration for '{field}': {details}")]
    Config { field: String, details: String },

    #[error("I/O error while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize payload")]
    Serialization {
        #[source]
        source: serde_json::Error,
    },
}

impl BridgeError {
    /// Returns whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::ConnectionClosed { .. } => false,
            BridgeError::ReadTimeout { .. } => true,
            BridgeError::MalformedFrameLength { .. } => false,
            BridgeError::InvalidKey { .. } => false,
            BridgeError::PublishTimeout { .. } => true,
            BridgeError::PublishRejected { .. } => true,
            BridgeError::CredentialExpired { .. } => true,
            BridgeError::Config { .. } => false,
            BridgeError::Io { .. } => true,
            BridgeError::Serialization { .. } => false,
        }
    }

    /// Returns whether this error means the inbound connection must be dropped.
    ///
    /// A read timeout is only fatal once it has thrown away part of a frame:
    /// the bytes that follow no longer start on a frame boundary.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            BridgeError::ConnectionClosed { .. } => true,
            BridgeError::ReadTimeout { discarded, .. } => *discarded > 0,
            BridgeError::Io { .. } => true,
            _ => false,
        }
    }

    /// Returns whether this error must stop the process before it serves anyone.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::MalformedFrameLength { .. }
                | BridgeError::InvalidKey { .. }
                | BridgeError::Config { .. }
        )
    }

    /// Returns whether this error came from the outbound broker side.
    pub fn is_publish_error(&self) -> bool {
        matches!(
            self,
            BridgeError::PublishTimeout { .. }
                | BridgeError::PublishRejected { .. }
                | BridgeError::CredentialExpired { .. }
                | BridgeError::Serialization { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BridgeError::ConnectionClosed { .. } => vec![
                "Check sensor power and Wi-Fi link",
                "Verify the sensor reconnects after a dropped session",
            ],
            BridgeError::ReadTimeout { .. } => vec![
                "Increase idleTimeoutSeconds",
                "Check the sensor sampling cadence against the frame size",
                "Raise readRetryBudget for bursty links",
            ],
            BridgeError::MalformedFrameLength { .. } => vec![
                "Set frameByteLength to twice the number of samples per frame",
                "Match the frame size configured in the sensor firmware",
            ],
            BridgeError::InvalidKey { .. } => vec![
                "Export the device primary key in the configured environment variable",
                "Copy the key exactly as shown by the hub (standard base64)",
            ],
            BridgeError::PublishTimeout { .. } => vec![
                "Check outbound connectivity to the hub on port 8883",
                "Increase publishTimeoutMillis",
            ],
            BridgeError::PublishRejected { .. } => vec![
                "Verify the device identity and key on the hub",
                "Check the hub message quota",
                "Check system clock accuracy (tokens are time-limited)",
            ],
            BridgeError::CredentialExpired { .. } => vec![
                "Check system clock accuracy",
                "Lower renewAtFraction to renew tokens earlier",
            ],
            BridgeError::Config { .. } => vec![
                "Review the configuration file and ECG_BRIDGE_* environment variables",
            ],
            BridgeError::Io { .. } => vec![
                "Check that the listen address is available",
                "Check network interface state",
            ],
            BridgeError::Serialization { .. } => vec!["Report this as a bug"],
        }
    }

    /// Helper constructor for a peer that went away mid-frame.
    pub fn connection_closed(received: usize, expected: usize) -> Self {
        BridgeError::ConnectionClosed { received, expected }
    }

    /// Helper constructor for idle read timeouts.
    pub fn read_timeout(duration: Duration, discarded: usize) -> Self {
        BridgeError::ReadTimeout { duration, discarded }
    }

    /// Helper constructor for unusable secret keys.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        BridgeError::InvalidKey { reason: reason.into() }
    }

    /// Helper constructor for broker rejections.
    pub fn publish_rejected(reason: impl Into<String>) -> Self {
        BridgeError::PublishRejected { reason: reason.into(), source: None }
    }

    /// Helper constructor for broker rejections with source.
    pub fn publish_rejected_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::PublishRejected { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for configuration errors.
    pub fn config(field: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::Config { field: field.into(), details: details.into() }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BridgeError::Io { context: context.into(), source }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization { source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn timeout_fatality_depends_only_on_discarded_bytes(
            duration_ms in 1u64..60000u64,
            discarded in 0usize..8192usize
          ) {
            let error = BridgeError::read_timeout(Duration::from_millis(duration_ms), discarded);

            prop_assert!(error.is_retryable());
            prop_assert_eq!(error.is_connection_fatal(), discarded > 0);
            prop_assert!(!error.is_startup_fatal());
          }

          #[test]
          fn error_messages_carry_their_context(
            reason in "[a-z ]{1,40}",
            received in 0usize..4000usize,
            length in 0usize..10000usize
          ) {
            let rejected = BridgeError::publish_rejected(reason.clone());
            prop_assert!(rejected.to_string().contains(&reason));

            let closed = BridgeError::connection_closed(received, 4000);
            prop_assert!(closed.to_string().contains(&received.to_string()));

            let malformed = BridgeError::MalformedFrameLength { length };
            prop_assert!(malformed.to_string().contains(&length.to_string()));
          }
        }
    }

    #[test]
    fn startup_errors_are_never_connection_errors() {
        let errors = [
            BridgeError::MalformedFrameLength { length: 7 },
            BridgeError::invalid_key("empty"),
            BridgeError::config("deviceId", "must not be empty"),
        ];

        for error in &errors {
            assert!(error.is_startup_fatal(), "{error} should be startup fatal");
            assert!(!error.is_connection_fatal());
            assert!(!error.is_retryable());
        }
    }

    #[test]
    fn publish_errors_are_frame_local() {
        let timeout = BridgeError::PublishTimeout { duration: Duration::from_secs(5) };
        let rejected = BridgeError::publish_rejected("not authorized");
        let expired = BridgeError::CredentialExpired { expired_at: 1_700_000_000 };

        for error in [&timeout, &rejected, &expired] {
            assert!(error.is_publish_error());
            assert!(!error.is_connection_fatal());
            assert!(error.is_retryable());
        }
    }

    #[test]
    fn closed_peer_is_connection_fatal() {
        let error = BridgeError::connection_closed(3, 8);
        assert!(error.is_connection_fatal());
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "Peer closed the connection after 3 of 8 frame bytes");
    }

    #[test]
    fn source_chain_is_preserved() {
        let inner = std::io::Error::other("tls handshake failed");
        let error = BridgeError::publish_rejected_with_source("connect failed", Box::new(inner));

        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "tls handshake failed");
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<BridgeError>();

        for suggestion in BridgeError::invalid_key("x").recovery_suggestions() {
            assert!(suggestion.len() > 5);
        }
    }
}
