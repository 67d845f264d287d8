//! Transport Abstraction Layer
//!
//! The bus core never talks to a broker directly. Each concrete broker (a
//! partitioned log, a topic/queue service, an AMQP channel, a key-value
//! pub/sub, an MQTT broker, or the in-process loopback) is wrapped in a
//! [`TransportAdapter`]; the core supplies a [`TransportEvents`] callback set
//! per subscription and drives partition processors from it.
//!
//! # Contract
//!
//! - A *partition* is the transport's unit of FIFO ordering; non-partitioned
//!   transports expose each queue or subscription as partition `0`.
//! - The adapter calls `on_assigned` before the first `on_message` for a
//!   partition, and `on_revoked`/`on_closed` exactly once at the end of the
//!   assignment. Callbacks for one partition are never invoked concurrently.
//! - Offsets are opaque per-transport positions; the core only relies on
//!   them being monotonically increasing within a partition.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryTransport;

/// Identifier of a partition within one subscription
pub type PartitionId = u32;

/// Common transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport connection is closed
    #[error("Transport connection is closed")]
    Closed,

    /// The named channel does not exist
    #[error("Unknown channel: {path}")]
    UnknownChannel {
        /// The channel that was addressed
        path: String,
    },

    /// Commit of a consumer position failed
    #[error("Commit failed at offset {offset}: {details}")]
    CommitFailed {
        /// Offset that was being committed
        offset: u64,
        /// Broker-specific failure details
        details: String,
    },

    /// Send was rejected or not acknowledged by the broker
    #[error("Send failed: {details}")]
    SendFailed {
        /// Broker-specific failure details
        details: String,
    },

    /// Transport-specific error
    #[error("Transport error: {details}")]
    Other {
        /// Broker-specific failure details
        details: String,
    },
}

impl TransportError {
    /// Create a send failure with details
    pub fn send_failed(details: impl Into<String>) -> Self {
        Self::SendFailed {
            details: details.into(),
        }
    }

    /// Create a transport-specific error with details
    pub fn other(details: impl Into<String>) -> Self {
        Self::Other {
            details: details.into(),
        }
    }
}

/// Result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One raw message delivered by a transport
///
/// Opaque to the core except for the header bag and the offset; the payload
/// is materialized by the transport's message provider.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Channel the message arrived on
    pub path: String,

    /// Partition the message arrived on
    pub partition: PartitionId,

    /// Transport position of this message, when the transport has one
    pub offset: Option<u64>,

    /// Raw payload bytes
    pub payload: Bytes,

    /// Transport header bag
    pub headers: HashMap<String, String>,
}

/// Callbacks the core supplies to a transport subscription
///
/// Implementations must tolerate `on_error` at any point; an error for one
/// message never tears down the partition.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    /// A partition was assigned to this consumer
    async fn on_assigned(&self, partition: PartitionId);

    /// A message arrived on an assigned partition
    async fn on_message(&self, message: InboundMessage);

    /// The consumer caught up to the end of a log partition
    async fn on_end_reached(&self, partition: PartitionId, offset: u64);

    /// The partition was taken away; another consumer will resume
    async fn on_revoked(&self, partition: PartitionId);

    /// The subscription is closing down
    async fn on_closed(&self, partition: PartitionId);

    /// A transport-level error occurred
    async fn on_error(&self, error: TransportError);
}

/// Broker adapter consumed by the bus core
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Subscribe to a channel; the adapter starts delivering through `events`
    async fn subscribe(
        &self,
        path: &str,
        group: Option<&str>,
        events: Arc<dyn TransportEvents>,
    ) -> TransportResult<()>;

    /// Produce a payload with headers to a channel
    async fn send(
        &self,
        path: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> TransportResult<()>;

    /// Record consumer progress for a partition
    async fn commit(
        &self,
        path: &str,
        group: Option<&str>,
        partition: PartitionId,
        offset: u64,
    ) -> TransportResult<()>;

    /// Stop all subscriptions and release broker resources
    async fn stop(&self) -> TransportResult<()>;
}

/// Commit sink for one `(path, group, partition)`
#[async_trait]
pub trait CheckpointCommitter: Send + Sync {
    /// Record progress at the given offset
    async fn commit(&self, offset: u64) -> TransportResult<()>;
}

/// [`CheckpointCommitter`] bound to a transport adapter subscription
pub struct TransportCommitter {
    transport: Arc<dyn TransportAdapter>,
    path: String,
    group: Option<String>,
    partition: PartitionId,
}

impl TransportCommitter {
    /// Bind a committer to one transport partition
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        path: impl Into<String>,
        group: Option<String>,
        partition: PartitionId,
    ) -> Self {
        Self {
            transport,
            path: path.into(),
            group,
            partition,
        }
    }
}

#[async_trait]
impl CheckpointCommitter for TransportCommitter {
    async fn commit(&self, offset: u64) -> TransportResult<()> {
        self.transport
            .commit(&self.path, self.group.as_deref(), self.partition, offset)
            .await
    }
}
