//! Pending Request Store
//!
//! Thread-safe table of requests awaiting their correlated responses.
//! `register` hands back a oneshot receiver the `send` path awaits; inbound
//! responses complete it through `resolve`, external cancellation through
//! `cancel`, and a background reaper faults entries whose expiry instant has
//! passed. The reaper runs on its own timer task and never fires from inside
//! transport callbacks.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, Duration as TokioDuration},
};
use tracing::{debug, trace, warn};

use crate::correlation::error::{RequestError, RequestResult};
use crate::correlation::types::{CounterIdGenerator, PendingRequest, RequestIdGenerator};
use crate::serialization::MessageSerializer;
use crate::time::Clock;

/// Tuning for the pending request store
#[derive(Debug, Clone)]
pub struct PendingStoreConfig {
    /// How often the reaper checks for expired entries; bounded to at most
    /// one second by configuration validation
    pub reaper_interval: TokioDuration,

    /// Maximum number of pending requests (0 = unlimited)
    pub max_pending: usize,
}

impl Default for PendingStoreConfig {
    fn default() -> Self {
        Self {
            reaper_interval: TokioDuration::from_millis(500),
            max_pending: 1000,
        }
    }
}

/// Process-wide store correlating responses to in-flight requests
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use chrono::{Duration, Utc};
/// use polybus::correlation::{PendingRequestStore, PendingStoreConfig};
/// use polybus::serialization::JsonSerializer;
/// use polybus::time::SystemClock;
///
/// # tokio_test::block_on(async {
/// let store = PendingRequestStore::start(
///     Arc::new(JsonSerializer),
///     Arc::new(SystemClock),
///     PendingStoreConfig::default(),
/// );
///
/// let id = store.next_request_id();
/// let receiver = store
///     .register(&id, "EchoResponse", Utc::now() + Duration::seconds(30))
///     .unwrap();
///
/// store.resolve(&id, Ok(bytes::Bytes::from_static(br#"{"ok":true}"#)));
///
/// let response = receiver.await.unwrap().unwrap();
/// assert_eq!(response["ok"], true);
/// store.shutdown().await;
/// # });
/// ```
pub struct PendingRequestStore {
    requests: Arc<DashMap<String, PendingRequest>>,
    id_generator: Arc<dyn RequestIdGenerator>,
    serializer: Arc<dyn MessageSerializer>,
    clock: Arc<dyn Clock>,
    config: PendingStoreConfig,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown_signal: Arc<AtomicBool>,
}

impl PendingRequestStore {
    /// Create the store and start its background reaper
    pub fn start(
        serializer: Arc<dyn MessageSerializer>,
        clock: Arc<dyn Clock>,
        config: PendingStoreConfig,
    ) -> Self {
        Self::with_generator(serializer, clock, config, Arc::new(CounterIdGenerator::new()))
    }

    /// Create the store with a specific request id generator
    pub fn with_generator(
        serializer: Arc<dyn MessageSerializer>,
        clock: Arc<dyn Clock>,
        config: PendingStoreConfig,
        id_generator: Arc<dyn RequestIdGenerator>,
    ) -> Self {
        let requests: Arc<DashMap<String, PendingRequest>> = Arc::new(DashMap::new());
        let shutdown_signal = Arc::new(AtomicBool::new(false));

        let reaper = Self::spawn_reaper(
            Arc::clone(&requests),
            Arc::clone(&clock),
            config.reaper_interval,
            Arc::clone(&shutdown_signal),
        );

        Self {
            requests,
            id_generator,
            serializer,
            clock,
            config,
            reaper: Mutex::new(Some(reaper)),
            shutdown_signal,
        }
    }

    /// Issue the next request id
    pub fn next_request_id(&self) -> String {
        self.id_generator.next_id()
    }

    /// Register a pending request
    ///
    /// Fails when the id is already pending or the store is at capacity.
    pub fn register(
        &self,
        request_id: &str,
        response_type: &str,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> RequestResult<oneshot::Receiver<RequestResult<Value>>> {
        if self.config.max_pending > 0 && self.requests.len() >= self.config.max_pending {
            return Err(RequestError::CapacityExceeded {
                limit: self.config.max_pending,
            });
        }

        let (sender, receiver) = oneshot::channel();
        let entry = PendingRequest::new(sender, response_type, self.clock.now(), expires_at);

        match self.requests.entry(request_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RequestError::DuplicateId {
                    id: request_id.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        debug!(request_id, response_type, "registered pending request");
        Ok(receiver)
    }

    /// Correlate an inbound response with a pending request
    ///
    /// `outcome` carries the raw response payload, or the error text from the
    /// response's error header. Unknown ids are ignored; a late response
    /// after timeout is normal.
    pub fn resolve(&self, request_id: &str, outcome: Result<Bytes, String>) {
        let Some((_, entry)) = self.requests.remove(request_id) else {
            trace!(request_id, "late response for unknown request id");
            return;
        };

        let result = match outcome {
            Ok(payload) => self
                .serializer
                .deserialize(&entry.response_type, &payload)
                .map_err(|error| RequestError::Internal {
                    message: format!("cannot decode response: {error}"),
                }),
            Err(message) => Err(RequestError::Remote {
                id: request_id.to_string(),
                message,
            }),
        };

        debug!(request_id, "correlated response");
        if entry.sender.send(result).is_err() {
            trace!(request_id, "awaiter dropped before correlation");
        }
    }

    /// Cancel a pending request
    ///
    /// Completes the awaiter with a cancellation error; ignores unknown ids
    /// (the response may have won the race).
    pub fn cancel(&self, request_id: &str) {
        if let Some((_, entry)) = self.requests.remove(request_id) {
            debug!(request_id, "cancelled pending request");
            let _ = entry.sender.send(Err(RequestError::Cancelled {
                id: request_id.to_string(),
            }));
        }
    }

    /// Remove and fault every entry expired at `now`; returns how many
    pub fn reap_expired(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        Self::reap(&self.requests, now)
    }

    /// Number of requests currently awaiting correlation
    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    /// Whether the id is currently pending
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    /// Stop the reaper and cancel all remaining requests
    pub async fn shutdown(&self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);

        let handle = self.reaper.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let pending_ids: Vec<String> = self
            .requests
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for request_id in pending_ids {
            self.cancel(&request_id);
        }

        debug!("pending request store shut down");
    }

    fn reap(requests: &DashMap<String, PendingRequest>, now: chrono::DateTime<chrono::Utc>) -> usize {
        let expired_ids: Vec<String> = requests
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .is_expired_at(&now)
                    .then(|| entry.key().clone())
            })
            .collect();

        let reaped = expired_ids.len();
        for request_id in expired_ids {
            if let Some((_, entry)) = requests.remove(&request_id) {
                warn!(request_id, "pending request timed out");
                let _ = entry.sender.send(Err(RequestError::Timeout { id: request_id }));
            }
        }
        reaped
    }

    fn spawn_reaper(
        requests: Arc<DashMap<String, PendingRequest>>,
        clock: Arc<dyn Clock>,
        reaper_interval: TokioDuration,
        shutdown_signal: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(reaper_interval);
            loop {
                ticker.tick().await;
                if shutdown_signal.load(Ordering::Relaxed) {
                    break;
                }
                let reaped = Self::reap(&requests, clock.now());
                if reaped > 0 {
                    debug!(reaped, "reaper faulted expired requests");
                }
            }
        })
    }
}

impl Drop for PendingRequestStore {
    fn drop(&mut self) {
        self.shutdown_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reaper.lock().ok().and_then(|mut guard| guard.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonSerializer;
    use crate::time::{ManualClock, SystemClock};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::HashSet;

    fn store_with_clock(clock: ManualClock) -> PendingRequestStore {
        PendingRequestStore::start(
            Arc::new(JsonSerializer),
            Arc::new(clock),
            PendingStoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_register_and_resolve_round_trip() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());

        let receiver = store
            .register("r1", "EchoResponse", clock.now() + Duration::seconds(30))
            .unwrap();
        assert_eq!(store.pending_count(), 1);
        assert!(store.is_pending("r1"));

        store.resolve("r1", Ok(Bytes::from_static(br#"{"message":"x"}"#)));

        let response = receiver.await.unwrap().unwrap();
        assert_eq!(response, json!({"message": "x"}));
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());
        let expires = clock.now() + Duration::seconds(30);

        let _receiver = store.register("r1", "EchoResponse", expires).unwrap();
        let error = store.register("r1", "EchoResponse", expires).unwrap_err();

        assert_eq!(
            error,
            RequestError::DuplicateId {
                id: "r1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_remote_error_faults_the_awaiter() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());

        let receiver = store
            .register("r2", "EchoResponse", clock.now() + Duration::seconds(30))
            .unwrap();
        store.resolve("r2", Err("bad".to_string()));

        let result = receiver.await.unwrap();
        assert_eq!(
            result,
            Err(RequestError::Remote {
                id: "r2".to_string(),
                message: "bad".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_cancel_completes_with_cancellation() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());

        let receiver = store
            .register("r3", "EchoResponse", clock.now() + Duration::seconds(30))
            .unwrap();
        store.cancel("r3");

        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(RequestError::Cancelled { .. })));
        assert!(!store.is_pending("r3"));

        // Unknown ids are a no-op
        store.cancel("r3");
    }

    #[tokio::test]
    async fn test_reap_expired_faults_with_timeout() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());

        let receiver = store
            .register("r4", "EchoResponse", clock.now() + Duration::seconds(5))
            .unwrap();
        let kept = store
            .register("r5", "EchoResponse", clock.now() + Duration::seconds(60))
            .unwrap();

        clock.advance(Duration::seconds(10));
        let reaped = store.reap_expired(clock.now());

        assert_eq!(reaped, 1);
        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(RequestError::Timeout { .. })));
        assert!(store.is_pending("r5"));
        drop(kept);
    }

    #[tokio::test]
    async fn test_late_response_is_ignored() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());

        // Never registered; must not panic or create an entry
        store.resolve("ghost", Ok(Bytes::from_static(b"{}")));
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let clock = ManualClock::starting_now();
        let store = PendingRequestStore::start(
            Arc::new(JsonSerializer),
            Arc::new(clock.clone()),
            PendingStoreConfig {
                max_pending: 2,
                ..Default::default()
            },
        );
        let expires = clock.now() + Duration::seconds(30);

        let _first = store.register("r1", "EchoResponse", expires).unwrap();
        let _second = store.register("r2", "EchoResponse", expires).unwrap();
        let error = store.register("r3", "EchoResponse", expires).unwrap_err();

        assert_eq!(error, RequestError::CapacityExceeded { limit: 2 });
    }

    #[tokio::test]
    async fn test_concurrent_sends_produce_distinct_ids() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(store_with_clock(clock.clone()));
        let expires = clock.now() + Duration::seconds(30);

        let mut handles = vec![];
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut ids = vec![];
                for _ in 0..25 {
                    let id = store.next_request_id();
                    let _receiver = store.register(&id, "EchoResponse", expires).unwrap();
                    ids.push(id);
                }
                ids
            }));
        }

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.await.unwrap());
        }

        let unique: HashSet<_> = all_ids.iter().collect();
        assert_eq!(unique.len(), 200);
        assert_eq!(store.pending_count(), 200);
    }

    #[tokio::test]
    async fn test_background_reaper_fires_within_interval() {
        let store = PendingRequestStore::start(
            Arc::new(JsonSerializer),
            Arc::new(SystemClock),
            PendingStoreConfig {
                reaper_interval: TokioDuration::from_millis(50),
                ..Default::default()
            },
        );

        let receiver = store
            .register("r1", "EchoResponse", Utc::now() + Duration::milliseconds(20))
            .unwrap();

        let result = tokio::time::timeout(TokioDuration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RequestError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_remaining_requests() {
        let clock = ManualClock::starting_now();
        let store = store_with_clock(clock.clone());

        let receiver = store
            .register("r1", "EchoResponse", clock.now() + Duration::seconds(30))
            .unwrap();

        store.shutdown().await;

        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(RequestError::Cancelled { .. })));
    }
}
