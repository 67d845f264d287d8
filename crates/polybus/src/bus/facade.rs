//! Message Bus
//!
//! The facade application code talks to. Producers publish typed messages or
//! send typed requests; consumption endpoints declared in [`BusConfig`] are
//! started as transport subscriptions driving partition processors.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use polybus::bus::MessageBus;
//! use polybus::config::{BusConfig, ProducerSettings};
//! use polybus::transport::MemoryTransport;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BusConfig {
//!         producers: vec![ProducerSettings::publisher("OrderPlaced", "orders")],
//!         ..Default::default()
//!     };
//!
//!     let bus = MessageBus::builder(config, MemoryTransport::shared())
//!         .build()
//!         .await?;
//!     bus.start().await?;
//!
//!     bus.publish("OrderPlaced", &json!({"id": 1}), None).await?;
//!
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::events::{EndpointEvents, ReplyEvents};
use crate::checkpoint;
use crate::config::{BusConfig, SubscriberSettings};
use crate::consumer::processor::{MessageProcessor, ResponseProducer};
use crate::correlation::{
    CounterIdGenerator, PendingRequestStore, PendingStoreConfig, RequestIdGenerator,
};
use crate::error::{BusError, BusResult};
use crate::headers::{well_known, HeaderCodec, Headers};
use crate::interceptor::{InterceptorRegistry, ProducerChain, ProducerTerminal};
use crate::locator::{ServiceLocator, SimpleLocator};
use crate::registry::{DefaultTypeResolver, MessageTypeResolver, TypeRegistry};
use crate::serialization::{provider_from_serializer, JsonSerializer, MessageSerializer};
use crate::time::{Clock, SystemClock};
use crate::transport::TransportAdapter;

/// Lifecycle state of the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Built, not yet started
    Created,
    /// Consumers are running
    Started,
    /// Stopped; terminal
    Stopped,
}

/// Options for one `publish` call
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Override the producer's default channel
    pub path: Option<String>,
}

/// Options for one `send` call
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Override the producer's default channel
    pub path: Option<String>,

    /// Override the request timeout
    pub timeout: Option<chrono::Duration>,

    /// External cancellation; cancelling faults the call and releases the
    /// pending entry
    pub cancellation: Option<CancellationToken>,
}

/// Builder wiring the bus collaborators
///
/// Only the topology and the transport are required; every collaborator has
/// a production default.
pub struct MessageBusBuilder {
    config: BusConfig,
    transport: Arc<dyn TransportAdapter>,
    serializer: Arc<dyn MessageSerializer>,
    registry: Arc<TypeRegistry>,
    resolver: Arc<dyn MessageTypeResolver>,
    interceptors: Arc<InterceptorRegistry>,
    locator: Arc<dyn ServiceLocator>,
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn RequestIdGenerator>,
    max_pending_requests: usize,
}

impl MessageBusBuilder {
    /// Start a builder over a topology and a transport
    pub fn new(config: BusConfig, transport: Arc<dyn TransportAdapter>) -> Self {
        Self {
            config,
            transport,
            serializer: Arc::new(JsonSerializer),
            registry: TypeRegistry::shared(),
            resolver: Arc::new(DefaultTypeResolver),
            interceptors: InterceptorRegistry::shared(),
            locator: Arc::new(SimpleLocator::new()),
            clock: Arc::new(SystemClock),
            id_generator: Arc::new(CounterIdGenerator::new()),
            max_pending_requests: PendingStoreConfig::default().max_pending,
        }
    }

    /// Replace the payload serializer
    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Supply the application type graph
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the message type resolver
    pub fn resolver(mut self, resolver: Arc<dyn MessageTypeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Supply interceptor registrations
    pub fn interceptors(mut self, interceptors: Arc<InterceptorRegistry>) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Supply the host service locator
    pub fn locator(mut self, locator: Arc<dyn ServiceLocator>) -> Self {
        self.locator = locator;
        self
    }

    /// Substitute the time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the request id generator
    pub fn id_generator(mut self, id_generator: Arc<dyn RequestIdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Cap the number of in-flight requests (0 = unlimited)
    pub fn max_pending_requests(mut self, max_pending_requests: usize) -> Self {
        self.max_pending_requests = max_pending_requests;
        self
    }

    /// Build the bus; the pending-request reaper starts immediately
    pub async fn build(self) -> BusResult<MessageBus> {
        let store = PendingRequestStore::with_generator(
            Arc::clone(&self.serializer),
            Arc::clone(&self.clock),
            PendingStoreConfig {
                reaper_interval: self.config.reaper_interval,
                max_pending: self.max_pending_requests,
            },
            self.id_generator,
        );

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                config: self.config,
                transport: self.transport,
                serializer: self.serializer,
                codec: HeaderCodec::new(),
                registry: self.registry,
                resolver: self.resolver,
                interceptors: self.interceptors,
                locator: self.locator,
                clock: self.clock,
                store,
                root: CancellationToken::new(),
                state: Mutex::new(BusState::Created),
            }),
        })
    }
}

/// Transport-agnostic message bus
///
/// Cheap to clone; all clones share the same bus instance.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    config: BusConfig,
    transport: Arc<dyn TransportAdapter>,
    serializer: Arc<dyn MessageSerializer>,
    codec: HeaderCodec,
    registry: Arc<TypeRegistry>,
    resolver: Arc<dyn MessageTypeResolver>,
    interceptors: Arc<InterceptorRegistry>,
    locator: Arc<dyn ServiceLocator>,
    clock: Arc<dyn Clock>,
    store: PendingRequestStore,
    root: CancellationToken,
    state: Mutex<BusState>,
}

impl MessageBus {
    /// Start building a bus over a topology and a transport
    pub fn builder(config: BusConfig, transport: Arc<dyn TransportAdapter>) -> MessageBusBuilder {
        MessageBusBuilder::new(config, transport)
    }

    /// Current lifecycle state
    pub fn state(&self) -> BusState {
        self.inner
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(BusState::Stopped)
    }

    /// Number of requests currently awaiting responses
    pub fn pending_requests(&self) -> usize {
        self.inner.store.pending_count()
    }

    /// Validate the topology and start every consumption endpoint
    pub async fn start(&self) -> BusResult<()> {
        self.inner.config.verify()?;
        let endpoints: Vec<_> = self
            .inner
            .config
            .endpoints
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();
        checkpoint::verify_consistency(&endpoints)?;

        self.inner.transition(BusState::Created, BusState::Started)?;

        let responder: Arc<dyn ResponseProducer> = Arc::clone(&self.inner) as _;
        for endpoint in endpoints {
            let processor = Arc::new(MessageProcessor::new(
                Arc::clone(&endpoint),
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.resolver),
                Arc::clone(&self.inner.interceptors),
                Arc::clone(&self.inner.locator),
                provider_from_serializer(Arc::clone(&self.inner.serializer)),
                Arc::clone(&self.inner.clock),
                Arc::downgrade(&responder),
            ));
            let events = Arc::new(EndpointEvents::new(
                Arc::clone(&endpoint),
                processor,
                Arc::clone(&self.inner.transport),
                Arc::clone(&self.inner.clock),
                self.inner.root.child_token(),
            ));
            self.inner
                .transport
                .subscribe(&endpoint.path, endpoint.group.as_deref(), events)
                .await?;
            debug!(path = %endpoint.path, "endpoint started");
        }

        if let Some(reply_path) = &self.inner.config.reply_path {
            let events = Arc::new(ReplyEvents::new(Arc::downgrade(&self.inner)));
            self.inner
                .transport
                .subscribe(reply_path, None, events)
                .await?;
            debug!(path = %reply_path, "reply channel started");
        }

        Ok(())
    }

    /// Cancel the root token, drain the partitions and dispose the store
    pub async fn stop(&self) -> BusResult<()> {
        self.inner.transition(BusState::Started, BusState::Stopped)?;

        self.inner.root.cancel();
        if let Err(error) = self.inner.transport.stop().await {
            warn!(%error, "transport stop reported an error");
        }
        self.inner.store.shutdown().await;

        debug!("bus stopped");
        Ok(())
    }

    /// Fire-and-forget produce
    ///
    /// Applies the producer interceptors and returns once the transport has
    /// acknowledged the send.
    pub async fn publish<T: Serialize>(
        &self,
        message_type: &str,
        message: &T,
        options: Option<PublishOptions>,
    ) -> BusResult<()> {
        self.inner.ensure_started()?;
        let producer = self.inner.producer_settings(message_type)?;
        let path = options
            .and_then(|options| options.path)
            .unwrap_or_else(|| producer.default_path.clone());

        let message = serde_json::to_value(message)
            .map_err(|error| BusError::serialization(error.to_string()))?;
        let mut headers = Headers::new();
        headers.insert(
            well_known::MESSAGE_TYPE,
            self.inner.resolver.to_wire(message_type),
        );

        self.inner
            .produce(path, message_type.to_string(), message, headers)
            .await
    }

    /// Send a request and await its correlated response
    ///
    /// Faults with the first of cancellation, timeout, remote error or
    /// transport error.
    pub async fn send<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        message_type: &str,
        request: &TReq,
        options: Option<SendOptions>,
    ) -> BusResult<TResp> {
        self.inner.ensure_started()?;
        let producer = self.inner.producer_settings(message_type)?;
        let response_type = producer.response_type.clone().ok_or_else(|| {
            BusError::configuration(format!(
                "'{message_type}' is not declared as a request producer"
            ))
        })?;
        let reply_path = self.inner.config.reply_path.clone().ok_or_else(|| {
            BusError::configuration("a reply path is required to send requests")
        })?;

        let options = options.unwrap_or_default();
        let timeout = options
            .timeout
            .or(producer.timeout)
            .unwrap_or(self.inner.config.default_request_timeout);
        let expires_at = self.inner.clock.now() + timeout;
        let path = options
            .path
            .unwrap_or_else(|| producer.default_path.clone());

        let request_id = self.inner.store.next_request_id();
        let receiver = self
            .inner
            .store
            .register(&request_id, &response_type, expires_at)?;

        let mut headers = Headers::new();
        headers.insert(
            well_known::MESSAGE_TYPE,
            self.inner.resolver.to_wire(message_type),
        );
        headers.insert(well_known::REQUEST_ID, request_id.clone());
        headers.insert(well_known::REPLY_TO, reply_path);
        headers.insert(well_known::EXPIRES, expires_at);

        let request = serde_json::to_value(request)
            .map_err(|error| BusError::serialization(error.to_string()))?;
        if let Err(error) = self
            .inner
            .produce(path, message_type.to_string(), request, headers)
            .await
        {
            self.inner.store.cancel(&request_id);
            return Err(error);
        }

        let external = options.cancellation.unwrap_or_default();
        tokio::select! {
            _ = external.cancelled() => {
                self.inner.store.cancel(&request_id);
                Err(BusError::Cancelled)
            }
            _ = self.inner.root.cancelled() => {
                self.inner.store.cancel(&request_id);
                Err(BusError::Cancelled)
            }
            outcome = receiver => {
                let response = outcome
                    .map_err(|_| BusError::internal("pending request store dropped the awaiter"))??;
                serde_json::from_value(response)
                    .map_err(|error| BusError::serialization(error.to_string()))
            }
        }
    }
}

impl BusInner {
    pub(crate) fn store(&self) -> &PendingRequestStore {
        &self.store
    }

    fn transition(&self, from: BusState, to: BusState) -> BusResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::internal("bus state poisoned"))?;
        if *state != from {
            return Err(BusError::configuration(format!(
                "bus is {:?}, expected {from:?}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn ensure_started(&self) -> BusResult<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| BusError::internal("bus state poisoned"))?;
        if *state != BusState::Started {
            return Err(BusError::configuration(format!(
                "bus is {:?}, expected Started",
                *state
            )));
        }
        Ok(())
    }

    fn producer_settings(&self, message_type: &str) -> BusResult<crate::config::ProducerSettings> {
        self.config
            .producer_for(message_type)
            .cloned()
            .ok_or_else(|| {
                BusError::configuration(format!(
                    "no producer is registered for message type '{message_type}'"
                ))
            })
    }

    /// Producer path: interceptor chain terminating in the transport send
    async fn produce(
        &self,
        path: String,
        message_type: String,
        message: Value,
        headers: Headers,
    ) -> BusResult<()> {
        // Producers fail fast once shutdown begins
        if self.root.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let interceptors = self.interceptors.producer_for(&message_type);
        let serializer = Arc::clone(&self.serializer);
        let codec = self.codec.clone();
        let transport = Arc::clone(&self.transport);
        let terminal: ProducerTerminal = Box::new(move |message, headers| {
            Box::pin(async move {
                let payload = serializer.serialize(&message_type, &message)?;
                let bag = codec.encode(&headers);
                transport
                    .send(&path, payload, bag)
                    .await
                    .map_err(BusError::from)
            })
        });

        ProducerChain::new(interceptors, terminal)
            .run(message, headers)
            .await
    }
}

#[async_trait]
impl ResponseProducer for BusInner {
    async fn produce_response(
        &self,
        _request: Option<&Value>,
        request_headers: &Headers,
        response: Option<Value>,
        response_headers: Headers,
        settings: &SubscriberSettings,
    ) -> BusResult<()> {
        let reply_to = request_headers
            .get_str(well_known::REPLY_TO)
            .ok_or_else(|| BusError::internal("produce_response without a reply channel"))?;

        let payload = match &response {
            Some(response) => {
                let response_type = settings.response_type.as_deref().unwrap_or_default();
                self.serializer.serialize(response_type, response)?
            }
            // Error responses travel with an empty body
            None => Bytes::new(),
        };

        let bag = self.codec.encode(&response_headers);
        self.transport
            .send(reply_to, payload, bag)
            .await
            .map_err(BusError::from)
    }
}
