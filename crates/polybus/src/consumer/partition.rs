//! Partition Processor
//!
//! Drives one partition of a consumer group through its lifecycle:
//! `Unassigned -> Assigned -> Running -> (Revoked | Closed)`. The transport
//! adapter invokes the transitions; messages on one partition are processed
//! strictly one at a time, which is what preserves the transport's ordering
//! guarantee.
//!
//! Commit discipline: every processed message increments the checkpoint
//! trigger, and when it fires the processor commits at the last seen offset.
//! Commits are monotonic and never regress. On revoke nothing is committed
//! (another consumer resumes from the last checkpoint); on close the
//! processor commits its final position best effort.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::checkpoint::CheckpointTrigger;
use crate::consumer::processor::MessageProcessor;
use crate::headers::HeaderCodec;
use crate::transport::{CheckpointCommitter, InboundMessage, PartitionId};

/// Lifecycle state of one partition assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// No assignment yet
    Unassigned,
    /// Assigned, no message processed yet
    Assigned,
    /// Actively processing
    Running,
    /// Assignment was taken away
    Revoked,
    /// Subscription closed down
    Closed,
}

/// Per-partition consumption lifecycle
///
/// All methods take `&mut self`: the transport contract guarantees callbacks
/// for one partition are never concurrent, and the exclusive borrow is what
/// makes "await in-flight work before acknowledging revoke" hold by
/// construction.
pub struct PartitionProcessor {
    partition: PartitionId,
    processor: Arc<MessageProcessor>,
    codec: HeaderCodec,
    committer: Arc<dyn CheckpointCommitter>,
    trigger: Option<CheckpointTrigger>,
    parent_cancellation: CancellationToken,
    cancellation: CancellationToken,
    last_seen: Option<u64>,
    last_committed: Option<u64>,
    state: PartitionState,
}

impl PartitionProcessor {
    /// Create a processor for one partition
    pub fn new(
        partition: PartitionId,
        processor: Arc<MessageProcessor>,
        committer: Arc<dyn CheckpointCommitter>,
        trigger: Option<CheckpointTrigger>,
        parent_cancellation: CancellationToken,
    ) -> Self {
        let cancellation = parent_cancellation.child_token();
        Self {
            partition,
            processor,
            codec: HeaderCodec::new(),
            committer,
            trigger,
            parent_cancellation,
            cancellation,
            last_seen: None,
            last_committed: None,
            state: PartitionState::Unassigned,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> PartitionState {
        self.state
    }

    /// Last offset handed to the message processor
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Last offset committed to the transport
    pub fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    /// The partition was assigned; reset all progress tracking
    pub fn on_assigned(&mut self) {
        debug!(partition = self.partition, "partition assigned");
        if let Some(trigger) = self.trigger.as_mut() {
            trigger.reset();
        }
        self.last_seen = None;
        self.last_committed = None;
        self.cancellation = self.parent_cancellation.child_token();
        self.state = PartitionState::Assigned;
    }

    /// A message arrived on this partition
    pub async fn on_message(&mut self, message: InboundMessage) {
        if self.cancellation.is_cancelled() {
            trace!(
                partition = self.partition,
                offset = ?message.offset,
                "dropping message on cancelled partition"
            );
            return;
        }

        self.state = PartitionState::Running;
        if let Some(offset) = message.offset {
            self.last_seen = Some(offset);
        }

        let headers = self.codec.decode(&message.headers);
        let result = self
            .processor
            .process_message(Arc::new(message), headers, self.cancellation.clone())
            .await;

        // Dispatch errors do not hold back the checkpoint; redelivery of a
        // message that already failed once would fail again
        if let Some(error) = &result.error {
            warn!(
                partition = self.partition,
                offset = ?self.last_seen,
                %error,
                "message dispatch failed; advancing"
            );
        }

        let fired = match self.trigger.as_mut() {
            Some(trigger) => trigger.increment(),
            None => false,
        };
        if fired {
            if let Some(offset) = self.last_seen {
                self.commit(offset).await;
            }
        }
    }

    /// The consumer caught up to the end of a log partition
    pub async fn on_end_reached(&mut self, offset: u64) {
        if self.trigger.is_some() {
            self.commit(offset).await;
        }
    }

    /// The partition was taken away; cancel without committing
    pub async fn on_revoked(&mut self) {
        debug!(partition = self.partition, "partition revoked");
        self.cancellation.cancel();
        self.state = PartitionState::Revoked;
    }

    /// The subscription is closing; commit the final position best effort
    pub async fn on_closed(&mut self) {
        debug!(partition = self.partition, "partition closed");
        if let Some(offset) = self.last_seen {
            self.commit(offset).await;
        }
        self.cancellation.cancel();
        self.state = PartitionState::Closed;
    }

    /// Monotonic commit: records progress, delegates to the transport
    /// committer and resets the checkpoint trigger
    async fn commit(&mut self, offset: u64) {
        if self.last_committed.is_some_and(|committed| offset <= committed) {
            return;
        }

        self.last_committed = Some(offset);
        if let Err(error) = self.committer.commit(offset).await {
            // Individual commit failures do not tear down the partition
            warn!(partition = self.partition, offset, %error, "commit failed");
        }
        if let Some(trigger) = self.trigger.as_mut() {
            trigger.reset();
        }
        trace!(partition = self.partition, offset, "committed");
    }
}
