//! Correlation Types
//!
//! Pending entries held by the store, and the pluggable request id
//! generators. An id only has to be unique within one store's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::correlation::error::RequestResult;

/// A request awaiting its correlated response
#[derive(Debug)]
pub struct PendingRequest {
    /// Channel delivering the correlated response or error
    pub sender: oneshot::Sender<RequestResult<Value>>,

    /// Declared response type, used to deserialize the response payload
    pub response_type: String,

    /// When the request was registered (UTC)
    pub created_at: DateTime<Utc>,

    /// Absolute instant after which the request is reaped
    pub expires_at: DateTime<Utc>,
}

impl PendingRequest {
    /// Create a pending entry
    pub fn new(
        sender: oneshot::Sender<RequestResult<Value>>,
        response_type: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sender,
            response_type: response_type.into(),
            created_at,
            expires_at,
        }
    }

    /// Whether the entry is expired at the given instant
    ///
    /// Takes the instant as an argument so a reaper pass over many entries
    /// reads the clock once.
    pub fn is_expired_at(&self, now: &DateTime<Utc>) -> bool {
        self.expires_at <= *now
    }
}

/// Pluggable request id source
pub trait RequestIdGenerator: Send + Sync {
    /// Produce the next unique request id
    fn next_id(&self) -> String;
}

/// Monotonic counter ids, unique per bus instance (the default)
#[derive(Debug)]
pub struct CounterIdGenerator {
    counter: AtomicU64,
}

impl CounterIdGenerator {
    /// Create a generator starting at 1
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }
}

impl Default for CounterIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator for CounterIdGenerator {
    fn next_id(&self) -> String {
        self.counter.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

/// Random 128-bit ids, unique across bus instances
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl RequestIdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
