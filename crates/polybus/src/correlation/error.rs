//! Requester-Side Error Types

use thiserror::Error;

/// Failure modes of a pending request
///
/// `send` faults with the first of cancellation, timeout, remote error or
/// transport error; the first three originate here.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    /// No response arrived before the request expired
    #[error("Request {id} timed out")]
    Timeout {
        /// The request id that expired
        id: String,
    },

    /// The remote handler reported an error
    #[error("Request {id} failed remotely: {message}")]
    Remote {
        /// The request id the response correlates to
        id: String,
        /// Error text carried on the response
        message: String,
    },

    /// The request was cancelled locally
    #[error("Request {id} was cancelled")]
    Cancelled {
        /// The request id that was cancelled
        id: String,
    },

    /// A request with the same id is already pending
    #[error("Request id {id} is already registered")]
    DuplicateId {
        /// The colliding request id
        id: String,
    },

    /// The store holds the maximum number of pending requests
    #[error("Maximum of {limit} pending requests exceeded")]
    CapacityExceeded {
        /// The configured capacity limit
        limit: usize,
    },

    /// Internal correlation failure
    #[error("Internal correlation error: {message}")]
    Internal {
        /// Description of the internal issue
        message: String,
    },
}

/// Single result type for correlation operations
pub type RequestResult<T> = std::result::Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_the_id() {
        let error = RequestError::Timeout {
            id: "r-17".to_string(),
        };
        assert!(format!("{error}").contains("r-17"));

        let error = RequestError::Remote {
            id: "r-17".to_string(),
            message: "bad".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("r-17"));
        assert!(display.contains("bad"));
    }
}
