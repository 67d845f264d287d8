//! Bus Error Types
//!
//! This module defines the crate-level error taxonomy. Every failure kind that
//! can cross a module boundary is distinguishable here: configuration errors
//! (fatal at startup), serialization errors, undeclared message types, handler
//! errors, transport errors and request-side failures.

use thiserror::Error;

use crate::correlation::RequestError;
use crate::transport::TransportError;

/// Crate-level error type for bus operations.
///
/// Errors raised inside one message's dispatch are captured and returned as
/// values (see `ProcessResult`); they never tear down a partition or the bus.
/// Configuration errors surfaced by `MessageBus::start` are fatal.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid topology or settings detected at startup
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the invalid configuration
        message: String,
    },

    /// Payload or header encoding/decoding failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure
        message: String,
    },

    /// The resolved message type matched no subscriber and the endpoint
    /// declares `UndeclaredTypePolicy::Fail`
    #[error("Message type '{message_type}' is not declared on endpoint '{path}'")]
    UndeclaredMessageType {
        /// Endpoint path the message arrived on
        path: String,
        /// The resolved message type name
        message_type: String,
    },

    /// An application consumer or handler returned an error
    #[error("Handler error: {message}")]
    Handler {
        /// The error reported by the application target
        message: String,
    },

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Requester-side failure (timeout, remote error, cancellation)
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The operation was cancelled by a cancellation token
    #[error("Operation was cancelled")]
    Cancelled,

    /// Internal invariant violation
    #[error("Internal bus error: {message}")]
    Internal {
        /// Description of the internal issue
        message: String,
    },
}

impl BusError {
    /// Create a configuration error with a message
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error with a message
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a handler error with a message
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an internal error with a message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Single result type for all bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BusError::UndeclaredMessageType {
            path: "orders".to_string(),
            message_type: "UnknownMessage".to_string(),
        };

        let display = format!("{error}");
        assert!(display.contains("UnknownMessage"));
        assert!(display.contains("orders"));
    }

    #[test]
    fn test_constructor_helpers() {
        let error = BusError::configuration("mismatched checkpoint settings");
        assert!(matches!(error, BusError::Configuration { .. }));

        let error = BusError::handler("boom");
        assert_eq!(format!("{error}"), "Handler error: boom");
    }

    #[test]
    fn test_transport_error_conversion() {
        let transport = TransportError::Closed;
        let error: BusError = transport.into();
        assert!(matches!(error, BusError::Transport(_)));
    }
}
