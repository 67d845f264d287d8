//! Transport Callback Bindings
//!
//! Two [`TransportEvents`] implementations connect the transport layer to
//! the core: [`EndpointEvents`] drives one partition processor per assigned
//! partition of a consumption endpoint, and [`ReplyEvents`] is the synthetic
//! subscriber on the reply channel that correlates inbound responses with
//! the pending request store.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::facade::BusInner;
use crate::checkpoint::CheckpointTrigger;
use crate::config::EndpointDescriptor;
use crate::consumer::partition::PartitionProcessor;
use crate::consumer::processor::MessageProcessor;
use crate::headers::{well_known, HeaderCodec};
use crate::time::Clock;
use crate::transport::{
    InboundMessage, PartitionId, TransportAdapter, TransportCommitter, TransportError,
    TransportEvents,
};

/// Drives the partition processors of one consumption endpoint
///
/// One partition processor exists per assigned partition; a per-partition
/// mutex serializes message handling, preserving the transport's FIFO order.
/// Revoke and close lock the same mutex, so they return only after any
/// in-flight dispatch has drained.
pub(crate) struct EndpointEvents {
    endpoint: Arc<EndpointDescriptor>,
    processor: Arc<MessageProcessor>,
    transport: Arc<dyn TransportAdapter>,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
    partitions: DashMap<PartitionId, Arc<Mutex<PartitionProcessor>>>,
}

impl EndpointEvents {
    pub(crate) fn new(
        endpoint: Arc<EndpointDescriptor>,
        processor: Arc<MessageProcessor>,
        transport: Arc<dyn TransportAdapter>,
        clock: Arc<dyn Clock>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            processor,
            transport,
            clock,
            cancellation,
            partitions: DashMap::new(),
        }
    }

    fn partition(&self, partition: PartitionId) -> Option<Arc<Mutex<PartitionProcessor>>> {
        self.partitions
            .get(&partition)
            .map(|entry| Arc::clone(&entry))
    }
}

#[async_trait]
impl TransportEvents for EndpointEvents {
    async fn on_assigned(&self, partition: PartitionId) {
        let committer = Arc::new(TransportCommitter::new(
            Arc::clone(&self.transport),
            self.endpoint.path.clone(),
            self.endpoint.group.clone(),
            partition,
        ));
        let trigger = CheckpointTrigger::from_endpoint(&self.endpoint, Arc::clone(&self.clock));
        let mut processor = PartitionProcessor::new(
            partition,
            Arc::clone(&self.processor),
            committer,
            trigger,
            self.cancellation.clone(),
        );
        processor.on_assigned();

        self.partitions
            .insert(partition, Arc::new(Mutex::new(processor)));
        debug!(path = %self.endpoint.path, partition, "partition processor created");
    }

    async fn on_message(&self, message: InboundMessage) {
        let Some(processor) = self.partition(message.partition) else {
            warn!(
                path = %self.endpoint.path,
                partition = message.partition,
                "message for unassigned partition dropped"
            );
            return;
        };
        processor.lock().await.on_message(message).await;
    }

    async fn on_end_reached(&self, partition: PartitionId, offset: u64) {
        if let Some(processor) = self.partition(partition) {
            processor.lock().await.on_end_reached(offset).await;
        }
    }

    async fn on_revoked(&self, partition: PartitionId) {
        if let Some((_, processor)) = self.partitions.remove(&partition) {
            processor.lock().await.on_revoked().await;
        }
    }

    async fn on_closed(&self, partition: PartitionId) {
        if let Some((_, processor)) = self.partitions.remove(&partition) {
            processor.lock().await.on_closed().await;
        }
    }

    async fn on_error(&self, error: TransportError) {
        // Individual transport errors never tear down the endpoint
        warn!(path = %self.endpoint.path, %error, "transport error");
    }
}

/// Synthetic subscriber on the reply channel
///
/// Reads the request id from each inbound response and completes the
/// matching pending request with the payload bytes or the carried error
/// text. Holds the bus weakly; responses arriving during teardown are
/// dropped.
pub(crate) struct ReplyEvents {
    bus: Weak<BusInner>,
    codec: HeaderCodec,
}

impl ReplyEvents {
    pub(crate) fn new(bus: Weak<BusInner>) -> Self {
        Self {
            bus,
            codec: HeaderCodec::new(),
        }
    }
}

#[async_trait]
impl TransportEvents for ReplyEvents {
    async fn on_assigned(&self, _partition: PartitionId) {}

    async fn on_message(&self, message: InboundMessage) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };

        let headers = self.codec.decode(&message.headers);
        let Some(request_id) = headers.get_str(well_known::REQUEST_ID) else {
            warn!(path = %message.path, "response without a request id");
            return;
        };

        match headers.get_str(well_known::ERROR) {
            Some(error) => bus.store().resolve(request_id, Err(error.to_string())),
            None => bus.store().resolve(request_id, Ok(message.payload.clone())),
        }
    }

    async fn on_end_reached(&self, _partition: PartitionId, _offset: u64) {}

    async fn on_revoked(&self, _partition: PartitionId) {}

    async fn on_closed(&self, _partition: PartitionId) {}

    async fn on_error(&self, error: TransportError) {
        warn!(%error, "transport error on reply channel");
    }
}
