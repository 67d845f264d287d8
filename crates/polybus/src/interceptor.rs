//! Interceptor Pipeline
//!
//! Ordered composition around the produce and consume paths. Interceptors
//! follow a pull model: each one receives the chain and decides whether to
//! call `next()`, short-circuit, or transform the downstream result. The
//! chain is a single small state object (an index over a shared slice plus a
//! terminal action); advancing allocates nothing per interceptor.
//!
//! For interceptors `[A, B]` around a target, the call order is
//! `A` (pre) -> `B` (pre) -> target -> `B` (post) -> `A` (post).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::consumer::context::ConsumerContext;
use crate::consumer::handler::{MessageConsumer, RequestHandler};
use crate::error::{BusError, BusResult};
use crate::headers::Headers;

/// Interceptor on the consume path
///
/// Returns the handler response observed downstream (`None` for
/// fire-and-forget consumers). Not calling `chain.next` short-circuits the
/// dispatch; the target is never invoked.
#[async_trait]
pub trait ConsumerInterceptor: Send + Sync {
    /// Intercept one dispatch
    async fn on_handle(
        &self,
        message: Value,
        ctx: &ConsumerContext,
        chain: &mut ConsumerChain,
    ) -> BusResult<Option<Value>>;
}

/// Interceptor on the produce path
///
/// Receives the message object and outbound headers by value and passes them
/// (possibly modified) down the chain; the terminal action serializes and
/// hands off to the transport.
#[async_trait]
pub trait ProducerInterceptor: Send + Sync {
    /// Intercept one produce
    async fn on_produce(
        &self,
        message: Value,
        headers: Headers,
        chain: &mut ProducerChain,
    ) -> BusResult<()>;
}

/// The application target terminating a consumer chain
pub enum ChainTarget {
    /// Fire-and-forget consumer
    Consumer(Arc<dyn MessageConsumer>),
    /// Request handler; its response travels back up the chain
    Handler(Arc<dyn RequestHandler>),
}

/// Consume-path chain state: interceptors in order plus the target
pub struct ConsumerChain {
    interceptors: Arc<[Arc<dyn ConsumerInterceptor>]>,
    index: usize,
    target: ChainTarget,
}

impl ConsumerChain {
    /// Build a chain over ordered interceptors and a target
    pub fn new(interceptors: Arc<[Arc<dyn ConsumerInterceptor>]>, target: ChainTarget) -> Self {
        Self {
            interceptors,
            index: 0,
            target,
        }
    }

    /// Advance the chain by exactly one step
    ///
    /// Invokes the next interceptor, or the target once the interceptors are
    /// exhausted.
    pub fn next<'a>(
        &'a mut self,
        message: Value,
        ctx: &'a ConsumerContext,
    ) -> BoxFuture<'a, BusResult<Option<Value>>> {
        Box::pin(async move {
            if self.index < self.interceptors.len() {
                let interceptor = Arc::clone(&self.interceptors[self.index]);
                self.index += 1;
                interceptor.on_handle(message, ctx, self).await
            } else {
                match &self.target {
                    ChainTarget::Consumer(consumer) => {
                        consumer.on_handle(message, ctx).await?;
                        Ok(None)
                    }
                    ChainTarget::Handler(handler) => {
                        handler.on_handle(message, ctx).await.map(Some)
                    }
                }
            }
        })
    }

    /// Run the whole chain to completion
    pub async fn run(mut self, message: Value, ctx: &ConsumerContext) -> BusResult<Option<Value>> {
        self.next(message, ctx).await
    }
}

/// Terminal action of a produce chain
pub type ProducerTerminal =
    Box<dyn FnOnce(Value, Headers) -> BoxFuture<'static, BusResult<()>> + Send>;

/// Produce-path chain state: interceptors in order plus the transport handoff
pub struct ProducerChain {
    interceptors: Arc<[Arc<dyn ProducerInterceptor>]>,
    index: usize,
    terminal: Option<ProducerTerminal>,
}

impl ProducerChain {
    /// Build a chain over ordered interceptors and a terminal action
    pub fn new(interceptors: Arc<[Arc<dyn ProducerInterceptor>]>, terminal: ProducerTerminal) -> Self {
        Self {
            interceptors,
            index: 0,
            terminal: Some(terminal),
        }
    }

    /// Advance the chain by exactly one step
    pub fn next(&mut self, message: Value, headers: Headers) -> BoxFuture<'_, BusResult<()>> {
        Box::pin(async move {
            if self.index < self.interceptors.len() {
                let interceptor = Arc::clone(&self.interceptors[self.index]);
                self.index += 1;
                interceptor.on_produce(message, headers, self).await
            } else {
                let terminal = self
                    .terminal
                    .take()
                    .ok_or_else(|| BusError::internal("producer chain advanced past its terminal"))?;
                terminal(message, headers).await
            }
        })
    }

    /// Run the whole chain to completion
    pub async fn run(mut self, message: Value, headers: Headers) -> BusResult<()> {
        self.next(message, headers).await
    }
}

type OrderedConsumerSlot = (i32, Arc<dyn ConsumerInterceptor>);
type OrderedProducerSlot = (i32, Arc<dyn ProducerInterceptor>);

/// Ordered interceptor registrations
///
/// Consumer-side interceptors are keyed by message type; handler-side
/// interceptors by `(message type, response type)`; producer-side by message
/// type. Registration order breaks ties between equal order values.
#[derive(Default)]
pub struct InterceptorRegistry {
    producer: DashMap<String, Vec<OrderedProducerSlot>>,
    consumer: DashMap<String, Vec<OrderedConsumerSlot>>,
    handler: DashMap<(String, String), Vec<OrderedConsumerSlot>>,
}

impl InterceptorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared empty registry wrapped for bus construction
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a producer interceptor for a message type
    pub fn add_producer(
        &self,
        message_type: impl Into<String>,
        order: i32,
        interceptor: Arc<dyn ProducerInterceptor>,
    ) {
        let mut slots = self.producer.entry(message_type.into()).or_default();
        slots.push((order, interceptor));
        slots.sort_by_key(|(order, _)| *order);
    }

    /// Register a consumer interceptor for a message type
    pub fn add_consumer(
        &self,
        message_type: impl Into<String>,
        order: i32,
        interceptor: Arc<dyn ConsumerInterceptor>,
    ) {
        let mut slots = self.consumer.entry(message_type.into()).or_default();
        slots.push((order, interceptor));
        slots.sort_by_key(|(order, _)| *order);
    }

    /// Register a handler interceptor for a request/response type pair
    pub fn add_handler(
        &self,
        message_type: impl Into<String>,
        response_type: impl Into<String>,
        order: i32,
        interceptor: Arc<dyn ConsumerInterceptor>,
    ) {
        let mut slots = self
            .handler
            .entry((message_type.into(), response_type.into()))
            .or_default();
        slots.push((order, interceptor));
        slots.sort_by_key(|(order, _)| *order);
    }

    /// Ordered producer interceptors for a message type
    pub fn producer_for(&self, message_type: &str) -> Arc<[Arc<dyn ProducerInterceptor>]> {
        self.producer
            .get(message_type)
            .map(|slots| slots.iter().map(|(_, i)| Arc::clone(i)).collect())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Ordered consumer interceptors for a message type
    pub fn consumer_for(&self, message_type: &str) -> Arc<[Arc<dyn ConsumerInterceptor>]> {
        self.consumer
            .get(message_type)
            .map(|slots| slots.iter().map(|(_, i)| Arc::clone(i)).collect())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Ordered handler interceptors for a request/response type pair
    pub fn handler_for(
        &self,
        message_type: &str,
        response_type: &str,
    ) -> Arc<[Arc<dyn ConsumerInterceptor>]> {
        self.handler
            .get(&(message_type.to_string(), response_type.to_string()))
            .map(|slots| slots.iter().map(|(_, i)| Arc::clone(i)).collect())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::transport::InboundMessage;

    fn ctx() -> ConsumerContext {
        ConsumerContext::new(
            "orders",
            CancellationToken::new(),
            Headers::new(),
            Arc::new(InboundMessage {
                path: "orders".to_string(),
                partition: 0,
                offset: None,
                payload: Bytes::from_static(b"{}"),
                headers: Default::default(),
            }),
        )
    }

    struct RecordingInterceptor {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ConsumerInterceptor for RecordingInterceptor {
        async fn on_handle(
            &self,
            message: Value,
            ctx: &ConsumerContext,
            chain: &mut ConsumerChain,
        ) -> BusResult<Option<Value>> {
            self.log.lock().unwrap().push(format!("{}.pre", self.name));
            let result = chain.next(message, ctx).await;
            self.log.lock().unwrap().push(format!("{}.post", self.name));
            result
        }
    }

    struct RecordingTarget {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageConsumer for RecordingTarget {
        async fn on_handle(&self, _message: Value, _ctx: &ConsumerContext) -> BusResult<()> {
            self.log.lock().unwrap().push("target".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interceptor_order_wraps_target() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Arc<[Arc<dyn ConsumerInterceptor>]> = Arc::from(vec![
            Arc::new(RecordingInterceptor {
                name: "A",
                log: Arc::clone(&log),
            }) as Arc<dyn ConsumerInterceptor>,
            Arc::new(RecordingInterceptor {
                name: "B",
                log: Arc::clone(&log),
            }),
        ]);

        let chain = ConsumerChain::new(
            interceptors,
            ChainTarget::Consumer(Arc::new(RecordingTarget {
                log: Arc::clone(&log),
            })),
        );
        chain.run(json!({}), &ctx()).await.unwrap();

        let observed = log.lock().unwrap().clone();
        assert_eq!(observed, vec!["A.pre", "B.pre", "target", "B.post", "A.post"]);
    }

    struct ShortCircuit;

    #[async_trait]
    impl ConsumerInterceptor for ShortCircuit {
        async fn on_handle(
            &self,
            _message: Value,
            _ctx: &ConsumerContext,
            _chain: &mut ConsumerChain,
        ) -> BusResult<Option<Value>> {
            Ok(Some(json!({"short": true})))
        }
    }

    #[tokio::test]
    async fn test_short_circuit_skips_target() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Arc<[Arc<dyn ConsumerInterceptor>]> =
            Arc::from(vec![Arc::new(ShortCircuit) as Arc<dyn ConsumerInterceptor>]);

        let chain = ConsumerChain::new(
            interceptors,
            ChainTarget::Consumer(Arc::new(RecordingTarget {
                log: Arc::clone(&log),
            })),
        );
        let result = chain.run(json!({}), &ctx()).await.unwrap();

        assert_eq!(result, Some(json!({"short": true})));
        assert!(log.lock().unwrap().is_empty());
    }

    struct ResultTransformer;

    #[async_trait]
    impl ConsumerInterceptor for ResultTransformer {
        async fn on_handle(
            &self,
            message: Value,
            ctx: &ConsumerContext,
            chain: &mut ConsumerChain,
        ) -> BusResult<Option<Value>> {
            let response = chain.next(message, ctx).await?;
            Ok(response.map(|value| json!({"wrapped": value})))
        }
    }

    struct EchoTarget;

    #[async_trait]
    impl RequestHandler for EchoTarget {
        async fn on_handle(&self, request: Value, _ctx: &ConsumerContext) -> BusResult<Value> {
            Ok(request)
        }
    }

    #[tokio::test]
    async fn test_interceptor_transforms_handler_response() {
        let interceptors: Arc<[Arc<dyn ConsumerInterceptor>]> =
            Arc::from(vec![Arc::new(ResultTransformer) as Arc<dyn ConsumerInterceptor>]);

        let chain = ConsumerChain::new(interceptors, ChainTarget::Handler(Arc::new(EchoTarget)));
        let result = chain.run(json!({"x": 1}), &ctx()).await.unwrap();

        assert_eq!(result, Some(json!({"wrapped": {"x": 1}})));
    }

    #[tokio::test]
    async fn test_producer_chain_reaches_terminal_with_mutated_headers() {
        struct Stamp;

        #[async_trait]
        impl ProducerInterceptor for Stamp {
            async fn on_produce(
                &self,
                message: Value,
                mut headers: Headers,
                chain: &mut ProducerChain,
            ) -> BusResult<()> {
                headers.insert("stamped", true);
                chain.next(message, headers).await
            }
        }

        let observed: Arc<Mutex<Option<Headers>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let interceptors: Arc<[Arc<dyn ProducerInterceptor>]> =
            Arc::from(vec![Arc::new(Stamp) as Arc<dyn ProducerInterceptor>]);
        let chain = ProducerChain::new(
            interceptors,
            Box::new(move |_message, headers| {
                Box::pin(async move {
                    *sink.lock().unwrap() = Some(headers);
                    Ok(())
                })
            }),
        );

        chain.run(json!({}), Headers::new()).await.unwrap();

        let headers = observed.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get_bool("stamped"), Some(true));
    }

    #[tokio::test]
    async fn test_registry_orders_by_order_value() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = InterceptorRegistry::new();
        registry.add_consumer(
            "SomeMessage",
            20,
            Arc::new(RecordingInterceptor {
                name: "B",
                log: Arc::clone(&log),
            }),
        );
        registry.add_consumer(
            "SomeMessage",
            10,
            Arc::new(RecordingInterceptor {
                name: "A",
                log: Arc::clone(&log),
            }),
        );

        let chain = ConsumerChain::new(
            registry.consumer_for("SomeMessage"),
            ChainTarget::Consumer(Arc::new(RecordingTarget {
                log: Arc::clone(&log),
            })),
        );
        chain.run(json!({}), &ctx()).await.unwrap();

        let observed = log.lock().unwrap().clone();
        assert_eq!(observed, vec!["A.pre", "B.pre", "target", "B.post", "A.post"]);
    }
}
