//! In-Memory Loopback Transport
//!
//! Single-process transport used by the `Direct` endpoint kind and by the
//! integration tests. Every channel is one partition; offsets are assigned
//! sequentially per channel and commits are recorded so tests can observe
//! checkpoint cadence.
//!
//! Delivery preserves per-channel FIFO: each subscription owns an unbounded
//! queue drained by a single pump task, so messages reach `on_message` one at
//! a time in send order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::trace;

use super::{
    InboundMessage, PartitionId, TransportAdapter, TransportError, TransportEvents,
    TransportResult,
};
use async_trait::async_trait;

struct Subscription {
    group: Option<String>,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct Channel {
    next_offset: AtomicU64,
    subscriptions: Vec<Subscription>,
}

/// Loopback transport delivering within the current process
///
/// Delivery is broadcast: every subscription on a channel receives every
/// message, which matches one consumer per group.
#[derive(Default)]
pub struct MemoryTransport {
    channels: DashMap<String, Channel>,
    committed: DashMap<(String, Option<String>, PartitionId), u64>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MemoryTransport {
    /// Create an empty loopback transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport wrapped for bus construction
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Last committed offset for a subscription, for test inspection
    pub fn committed_offset(
        &self,
        path: &str,
        group: Option<&str>,
        partition: PartitionId,
    ) -> Option<u64> {
        self.committed
            .get(&(path.to_string(), group.map(str::to_string), partition))
            .map(|entry| *entry)
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    async fn subscribe(
        &self,
        path: &str,
        group: Option<&str>,
        events: Arc<dyn TransportEvents>,
    ) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<InboundMessage>();
        self.channels
            .entry(path.to_string())
            .or_default()
            .subscriptions
            .push(Subscription {
                group: group.map(str::to_string),
                sender,
            });

        let pump = tokio::spawn(async move {
            events.on_assigned(0).await;
            while let Some(message) = receiver.recv().await {
                events.on_message(message).await;
            }
            events.on_closed(0).await;
        });
        self.pumps.lock().await.push(pump);

        trace!(path, ?group, "loopback subscription registered");
        Ok(())
    }

    async fn send(
        &self,
        path: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> TransportResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let channel = self.channels.entry(path.to_string()).or_default();
        let offset = channel.next_offset.fetch_add(1, Ordering::SeqCst);

        for subscription in &channel.subscriptions {
            let message = InboundMessage {
                path: path.to_string(),
                partition: 0,
                offset: Some(offset),
                payload: payload.clone(),
                headers: headers.clone(),
            };
            // A closed pump only means that subscriber is gone
            let _ = subscription.sender.send(message);
        }

        Ok(())
    }

    async fn commit(
        &self,
        path: &str,
        group: Option<&str>,
        partition: PartitionId,
        offset: u64,
    ) -> TransportResult<()> {
        self.committed.insert(
            (path.to_string(), group.map(str::to_string), partition),
            offset,
        );
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.stopped.store(true, Ordering::SeqCst);

        // Dropping the senders lets each pump drain and emit on_closed
        self.channels.clear();

        let pumps: Vec<JoinHandle<()>> = self.pumps.lock().await.drain(..).collect();
        for pump in pumps {
            let _ = pump.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingEvents {
        assigned: AtomicUsize,
        closed: AtomicUsize,
        offsets: Mutex<Vec<Option<u64>>>,
        seen: Notify,
    }

    #[async_trait]
    impl TransportEvents for RecordingEvents {
        async fn on_assigned(&self, _partition: PartitionId) {
            self.assigned.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_message(&self, message: InboundMessage) {
            self.offsets.lock().await.push(message.offset);
            self.seen.notify_one();
        }

        async fn on_end_reached(&self, _partition: PartitionId, _offset: u64) {}

        async fn on_revoked(&self, _partition: PartitionId) {}

        async fn on_closed(&self, _partition: PartitionId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _error: TransportError) {}
    }

    #[tokio::test]
    async fn test_fifo_delivery_with_sequential_offsets() {
        let transport = MemoryTransport::new();
        let events = Arc::new(RecordingEvents::default());
        transport
            .subscribe("orders", Some("g1"), Arc::clone(&events) as _)
            .await
            .unwrap();

        for _ in 0..3 {
            transport
                .send("orders", Bytes::from_static(b"{}"), HashMap::new())
                .await
                .unwrap();
        }

        while events.offsets.lock().await.len() < 3 {
            events.seen.notified().await;
        }

        let offsets = events.offsets.lock().await.clone();
        assert_eq!(offsets, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(events.assigned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_subscriptions_and_rejects_sends() {
        let transport = MemoryTransport::new();
        let events = Arc::new(RecordingEvents::default());
        transport
            .subscribe("orders", None, Arc::clone(&events) as _)
            .await
            .unwrap();

        transport.stop().await.unwrap();

        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
        let result = transport
            .send("orders", Bytes::from_static(b"{}"), HashMap::new())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_commits_are_observable() {
        let transport = MemoryTransport::new();
        transport.commit("orders", Some("g1"), 0, 9).await.unwrap();

        assert_eq!(transport.committed_offset("orders", Some("g1"), 0), Some(9));
        assert_eq!(transport.committed_offset("orders", None, 0), None);
    }
}
