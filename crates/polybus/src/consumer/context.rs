//! Consumer Context
//!
//! Per-invocation bag handed to application targets and interceptors. A
//! fresh context is created when dispatch of one inbound message begins and
//! dropped when the target returns.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::headers::Headers;
use crate::transport::InboundMessage;

/// Context for one target invocation
///
/// Targets observe partition revocation and bus shutdown through the
/// cancellation token; long-running handlers should poll it at their own
/// suspension points.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    path: String,
    cancellation: CancellationToken,
    headers: Headers,
    transport_message: Arc<InboundMessage>,
}

impl ConsumerContext {
    /// Create a context for one dispatch
    pub fn new(
        path: impl Into<String>,
        cancellation: CancellationToken,
        headers: Headers,
        transport_message: Arc<InboundMessage>,
    ) -> Self {
        Self {
            path: path.into(),
            cancellation,
            headers,
            transport_message,
        }
    }

    /// Endpoint path the message arrived on
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Cancellation token for this dispatch
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Read-only view of the decoded message headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw transport message, for diagnostics
    pub fn transport_message(&self) -> &InboundMessage {
        &self.transport_message
    }
}
