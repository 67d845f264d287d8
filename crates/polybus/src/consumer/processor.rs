//! Message Processor
//!
//! The per-message dispatch engine. For one inbound transport message it
//! resolves the concrete application message type, selects every matching
//! subscriber on the endpoint, instantiates targets through the service
//! locator (optionally inside a per-message scope), runs the ordered
//! interceptor chain around each target, and produces responses for request
//! handlers back on the caller's reply channel.
//!
//! Dispatch errors are captured in the returned [`ProcessResult`], never
//! propagated as panics or surfaced to the transport; the partition
//! processor decides what to do with them. The processor itself never
//! retries.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{EndpointDescriptor, SubscriberSettings};
use crate::consumer::context::ConsumerContext;
use crate::error::{BusError, BusResult};
use crate::headers::{well_known, Headers};
use crate::interceptor::{ChainTarget, ConsumerChain, InterceptorRegistry};
use crate::locator::{ConsumerInstance, ServiceLocator, ServiceScope};
use crate::registry::{MessageTypeResolver, TypeRegistry};
use crate::serialization::MessageProvider;
use crate::time::Clock;
use crate::transport::InboundMessage;

/// Sink for responses produced by request handlers
///
/// Implemented by the bus facade; the processor reaches it through a weak
/// reference so the facade can own the processors without a cycle.
#[async_trait]
pub trait ResponseProducer: Send + Sync {
    /// Emit a response (or an error response) on the request's reply channel
    async fn produce_response(
        &self,
        request: Option<&Value>,
        request_headers: &Headers,
        response: Option<Value>,
        response_headers: Headers,
        settings: &SubscriberSettings,
    ) -> BusResult<()>;
}

/// Outcome of dispatching one inbound message
///
/// A dispatch error never returns a response object and produces a response
/// message on the same call: a handler error that traveled back to the
/// caller as an error response is not repeated in `error`.
#[derive(Debug, Default)]
pub struct ProcessResult {
    /// Last dispatch error, for error reporting
    pub error: Option<BusError>,

    /// Settings of the subscriber the error is attributed to, or the first
    /// matched subscriber
    pub settings: Option<SubscriberSettings>,

    /// First handler response that was not emitted on a reply channel
    pub response: Option<Value>,

    /// The materialized payload object, regardless of dispatch outcome
    pub payload: Option<Value>,
}

/// Per-endpoint dispatch engine
pub struct MessageProcessor {
    endpoint: Arc<EndpointDescriptor>,
    registry: Arc<TypeRegistry>,
    resolver: Arc<dyn MessageTypeResolver>,
    interceptors: Arc<InterceptorRegistry>,
    locator: Arc<dyn ServiceLocator>,
    provider: MessageProvider,
    clock: Arc<dyn Clock>,
    responder: Weak<dyn ResponseProducer>,
}

impl MessageProcessor {
    /// Create a processor for one endpoint
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Arc<EndpointDescriptor>,
        registry: Arc<TypeRegistry>,
        resolver: Arc<dyn MessageTypeResolver>,
        interceptors: Arc<InterceptorRegistry>,
        locator: Arc<dyn ServiceLocator>,
        provider: MessageProvider,
        clock: Arc<dyn Clock>,
        responder: Weak<dyn ResponseProducer>,
    ) -> Self {
        Self {
            endpoint,
            registry,
            resolver,
            interceptors,
            locator,
            provider,
            clock,
            responder,
        }
    }

    /// The endpoint this processor dispatches for
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// Dispatch one inbound message to every matching subscriber
    pub async fn process_message(
        &self,
        inbound: Arc<InboundMessage>,
        headers: Headers,
        cancellation: CancellationToken,
    ) -> ProcessResult {
        // Step 1: resolve the concrete message type
        let resolved = match headers.get_str(well_known::MESSAGE_TYPE) {
            Some(wire_name) => self.resolver.from_wire(wire_name),
            None => self
                .endpoint
                .subscribers
                .first()
                .map(|subscriber| subscriber.message_type.clone()),
        };

        let Some(resolved) = resolved else {
            return self.undeclared(headers.get_str(well_known::MESSAGE_TYPE).unwrap_or("?"));
        };

        let matched: Vec<&SubscriberSettings> = self
            .endpoint
            .subscribers
            .iter()
            .filter(|subscriber| {
                self.registry
                    .is_assignable(&resolved, &subscriber.message_type)
            })
            .collect();

        // Step 2: undeclared-type policy
        if matched.is_empty() {
            return self.undeclared(&resolved);
        }

        // Step 3: materialize the payload object
        let payload = match (self.provider)(&resolved, &inbound) {
            Ok(payload) => payload,
            Err(error) => {
                return ProcessResult {
                    error: Some(error),
                    settings: Some(matched[0].clone()),
                    response: None,
                    payload: None,
                }
            }
        };

        // The scope spans the whole dispatch for all subscribers that opted
        // in; dropped on every exit path
        let scope: Option<Box<dyn ServiceScope>> = matched
            .iter()
            .any(|subscriber| subscriber.per_message_scope)
            .then(|| self.locator.create_scope());

        let mut last_error: Option<BusError> = None;
        let mut error_settings: Option<SubscriberSettings> = None;
        let mut first_response: Option<Value> = None;

        // Step 4: dispatch serially in declaration order
        for subscriber in &matched {
            if cancellation.is_cancelled() {
                break;
            }

            // Step 4a: expired requests are counted as delivered but never
            // reach the handler, and no response is emitted
            if subscriber.is_handler() {
                if let Some(expires) = headers.get_timestamp(well_known::EXPIRES) {
                    if expires <= self.clock.now() {
                        debug!(
                            path = %self.endpoint.path,
                            message_type = %resolved,
                            "request expired before dispatch"
                        );
                        continue;
                    }
                }
            }

            // Steps 4b-4c: resolve the target, scoped when requested
            let instance = if subscriber.per_message_scope {
                scope
                    .as_ref()
                    .and_then(|scope| scope.resolve(&subscriber.factory_key))
            } else {
                self.locator.resolve(&subscriber.factory_key)
            };

            let target = match (instance, subscriber.is_handler()) {
                (Some(ConsumerInstance::Handler(handler)), true) => ChainTarget::Handler(handler),
                (Some(ConsumerInstance::Consumer(consumer)), false) => {
                    ChainTarget::Consumer(consumer)
                }
                (Some(_), _) => {
                    last_error = Some(BusError::configuration(format!(
                        "target '{}' does not match the declared subscriber kind",
                        subscriber.factory_key
                    )));
                    error_settings = Some((*subscriber).clone());
                    continue;
                }
                (None, _) => {
                    last_error = Some(BusError::configuration(format!(
                        "no target registered for factory key '{}'",
                        subscriber.factory_key
                    )));
                    error_settings = Some((*subscriber).clone());
                    continue;
                }
            };

            // Step 4d: fresh context per invocation
            let ctx = ConsumerContext::new(
                self.endpoint.path.clone(),
                cancellation.clone(),
                headers.clone(),
                Arc::clone(&inbound),
            );

            // Step 4e: interceptor chain terminating in the target
            let slots = match &subscriber.response_type {
                Some(response_type) => self
                    .interceptors
                    .handler_for(&subscriber.message_type, response_type),
                None => self.interceptors.consumer_for(&subscriber.message_type),
            };
            let chain = ConsumerChain::new(slots, target);

            // Step 4f: await the chain, capture the outcome
            trace!(
                path = %self.endpoint.path,
                factory_key = %subscriber.factory_key,
                "dispatching to subscriber"
            );
            match chain.run(payload.clone(), &ctx).await {
                Ok(response) => {
                    if let Some(response) = response.filter(|_| subscriber.is_handler()) {
                        let emitted = self
                            .emit_response(subscriber, &headers, &payload, Ok(response.clone()))
                            .await;
                        match emitted {
                            Ok(true) => {}
                            Ok(false) => {
                                if first_response.is_none() {
                                    first_response = Some(response);
                                }
                            }
                            Err(error) => {
                                last_error = Some(error);
                                error_settings = Some((*subscriber).clone());
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        path = %self.endpoint.path,
                        factory_key = %subscriber.factory_key,
                        %error,
                        "subscriber dispatch failed"
                    );
                    if subscriber.is_handler() {
                        // Step 5: a handler error travels back to the caller
                        // as an error response when reply information exists
                        match self
                            .emit_response(subscriber, &headers, &payload, Err(&error))
                            .await
                        {
                            Ok(true) => {}
                            Ok(false) | Err(_) => {
                                last_error = Some(error);
                                error_settings = Some((*subscriber).clone());
                            }
                        }
                    } else {
                        last_error = Some(error);
                        error_settings = Some((*subscriber).clone());
                    }
                }
            }
        }

        let settings = error_settings.or_else(|| Some(matched[0].clone()));

        ProcessResult {
            error: last_error,
            settings,
            response: first_response,
            payload: Some(payload),
        }
    }

    fn undeclared(&self, resolved: &str) -> ProcessResult {
        use crate::config::UndeclaredTypePolicy;

        match self.endpoint.undeclared_policy {
            UndeclaredTypePolicy::Fail => ProcessResult {
                error: Some(BusError::UndeclaredMessageType {
                    path: self.endpoint.path.clone(),
                    message_type: resolved.to_string(),
                }),
                ..Default::default()
            },
            UndeclaredTypePolicy::Ignore => {
                trace!(
                    path = %self.endpoint.path,
                    message_type = %resolved,
                    "ignoring undeclared message type"
                );
                ProcessResult::default()
            }
        }
    }

    /// Produce a success or error response for a handled request
    ///
    /// Returns `Ok(true)` when a response message was emitted, `Ok(false)`
    /// when the endpoint or headers preclude one.
    async fn emit_response(
        &self,
        subscriber: &SubscriberSettings,
        request_headers: &Headers,
        payload: &Value,
        outcome: Result<Value, &BusError>,
    ) -> BusResult<bool> {
        if !self.endpoint.send_responses {
            return Ok(false);
        }
        let (Some(request_id), Some(_reply_to)) = (
            request_headers.get_str(well_known::REQUEST_ID),
            request_headers.get_str(well_known::REPLY_TO),
        ) else {
            return Ok(false);
        };
        let Some(responder) = self.responder.upgrade() else {
            return Err(BusError::internal("bus facade is gone"));
        };

        let mut response_headers = Headers::new();
        response_headers.insert(well_known::REQUEST_ID, request_id);
        if let Some(response_type) = &subscriber.response_type {
            response_headers.insert(
                well_known::MESSAGE_TYPE,
                self.resolver.to_wire(response_type),
            );
        }

        let response = match outcome {
            Ok(response) => Some(response),
            Err(error) => {
                response_headers.insert(well_known::ERROR, error.to_string());
                None
            }
        };

        responder
            .produce_response(
                Some(payload),
                request_headers,
                response,
                response_headers,
                subscriber,
            )
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::config::{EndpointKind, UndeclaredTypePolicy};
    use crate::consumer::handler::{MessageConsumer, RequestHandler};
    use crate::locator::SimpleLocator;
    use crate::registry::DefaultTypeResolver;
    use crate::serialization::{provider_from_serializer, JsonSerializer};
    use crate::time::ManualClock;

    struct CountingConsumer {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageConsumer for CountingConsumer {
        async fn on_handle(&self, _message: Value, _ctx: &ConsumerContext) -> BusResult<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EchoHandler {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn on_handle(&self, request: Value, _ctx: &ConsumerContext) -> BusResult<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(request)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl RequestHandler for FailingHandler {
        async fn on_handle(&self, _request: Value, _ctx: &ConsumerContext) -> BusResult<Value> {
            Err(BusError::handler("bad"))
        }
    }

    #[derive(Default)]
    struct RecordingResponder {
        calls: Mutex<Vec<(Option<Value>, Headers)>>,
    }

    #[async_trait]
    impl ResponseProducer for RecordingResponder {
        async fn produce_response(
            &self,
            _request: Option<&Value>,
            _request_headers: &Headers,
            response: Option<Value>,
            response_headers: Headers,
            _settings: &SubscriberSettings,
        ) -> BusResult<()> {
            self.calls.lock().unwrap().push((response, response_headers));
            Ok(())
        }
    }

    struct Fixture {
        processor: MessageProcessor,
        responder: Arc<RecordingResponder>,
        clock: ManualClock,
        // Keeps the weak responder reference in the processor alive
        _responder_strong: Arc<dyn ResponseProducer>,
    }

    fn fixture(endpoint: EndpointDescriptor, locator: SimpleLocator) -> Fixture {
        let registry = TypeRegistry::new();
        registry.register_type("SomeMessage", &[]);
        registry.register_type("SomeDerivedMessage", &["SomeMessage", "IMarker"]);
        registry.register_type("SomeRequest", &[]);

        let clock = ManualClock::starting_now();
        let responder = Arc::new(RecordingResponder::default());
        let responder_dyn: Arc<dyn ResponseProducer> = Arc::clone(&responder) as _;
        let processor = MessageProcessor::new(
            Arc::new(endpoint),
            Arc::new(registry),
            Arc::new(DefaultTypeResolver),
            InterceptorRegistry::shared(),
            Arc::new(locator),
            provider_from_serializer(Arc::new(JsonSerializer)),
            Arc::new(clock.clone()),
            Arc::downgrade(&responder_dyn),
        );

        Fixture {
            processor,
            responder,
            clock,
            _responder_strong: responder_dyn,
        }
    }

    fn inbound(payload: &str) -> Arc<InboundMessage> {
        Arc::new(InboundMessage {
            path: "t".to_string(),
            partition: 0,
            offset: Some(0),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            headers: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_expired_request_never_reaches_the_handler() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let locator = SimpleLocator::new();
        locator.register_handler(
            "echo",
            Arc::new(EchoHandler {
                invocations: Arc::clone(&invocations),
            }),
        );
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription).with_subscriber(
            SubscriberSettings::handler("SomeRequest", "echo", "SomeResponse"),
        );
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "SomeRequest");
        headers.insert(well_known::REQUEST_ID, "r1");
        headers.insert(well_known::REPLY_TO, "q-reply");
        headers.insert(
            well_known::EXPIRES,
            fixture.clock.now() - Duration::seconds(10),
        );

        let result = fixture
            .processor
            .process_message(
                inbound(r#"{"message":"x"}"#),
                headers,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert!(result.error.is_none());
        assert!(result.response.is_none());
        assert_eq!(result.payload, Some(json!({"message": "x"})));
        assert!(fixture.responder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_fault_sends_error_response() {
        let locator = SimpleLocator::new();
        locator.register_handler("failing", Arc::new(FailingHandler));
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription).with_subscriber(
            SubscriberSettings::handler("SomeRequest", "failing", "SomeResponse"),
        );
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "SomeRequest");
        headers.insert(well_known::REQUEST_ID, "r2");
        headers.insert(well_known::REPLY_TO, "q-reply");

        let result = fixture
            .processor
            .process_message(inbound(r#"{}"#), headers, CancellationToken::new())
            .await;

        // The error traveled via the response, not the tuple
        assert!(result.error.is_none());

        let calls = fixture.responder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (response, response_headers) = &calls[0];
        assert!(response.is_none());
        assert_eq!(response_headers.get_str(well_known::REQUEST_ID), Some("r2"));
        let error_text = response_headers.get_str(well_known::ERROR).unwrap_or("");
        assert!(error_text.contains("bad"));
    }

    #[tokio::test]
    async fn test_multi_subscriber_dispatch_follows_the_type_graph() {
        let base = Arc::new(AtomicUsize::new(0));
        let derived = Arc::new(AtomicUsize::new(0));
        let marker = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));

        let locator = SimpleLocator::new();
        locator.register_consumer(
            "base",
            Arc::new(CountingConsumer {
                invocations: Arc::clone(&base),
            }),
        );
        locator.register_consumer(
            "derived",
            Arc::new(CountingConsumer {
                invocations: Arc::clone(&derived),
            }),
        );
        locator.register_consumer(
            "marker",
            Arc::new(CountingConsumer {
                invocations: Arc::clone(&marker),
            }),
        );
        locator.register_handler(
            "request",
            Arc::new(EchoHandler {
                invocations: Arc::clone(&handled),
            }),
        );

        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription)
            .with_subscriber(SubscriberSettings::consumer("SomeMessage", "base"))
            .with_subscriber(SubscriberSettings::consumer("SomeDerivedMessage", "derived"))
            .with_subscriber(SubscriberSettings::consumer("IMarker", "marker"))
            .with_subscriber(SubscriberSettings::handler(
                "SomeRequest",
                "request",
                "SomeResponse",
            ));
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "SomeDerivedMessage");

        let result = fixture
            .processor
            .process_message(inbound(r#"{}"#), headers, CancellationToken::new())
            .await;

        assert!(result.error.is_none());
        assert_eq!(base.load(Ordering::SeqCst), 1);
        assert_eq!(derived.load(Ordering::SeqCst), 1);
        assert_eq!(marker.load(Ordering::SeqCst), 1);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undeclared_type_fails_when_policy_says_so() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let locator = SimpleLocator::new();
        locator.register_consumer(
            "base",
            Arc::new(CountingConsumer {
                invocations: Arc::clone(&invocations),
            }),
        );
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription)
            .with_subscriber(SubscriberSettings::consumer("SomeMessage", "base"))
            .with_undeclared_policy(UndeclaredTypePolicy::Fail);
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "Unknown");

        let result = fixture
            .processor
            .process_message(inbound(r#"{}"#), headers, CancellationToken::new())
            .await;

        assert!(matches!(
            result.error,
            Some(BusError::UndeclaredMessageType { .. })
        ));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert!(result.payload.is_none());
    }

    #[tokio::test]
    async fn test_undeclared_type_ignored_by_default() {
        let locator = SimpleLocator::new();
        locator.register_consumer(
            "base",
            Arc::new(CountingConsumer {
                invocations: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription)
            .with_subscriber(SubscriberSettings::consumer("SomeMessage", "base"));
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "Unknown");

        let result = fixture
            .processor
            .process_message(inbound(r#"{}"#), headers, CancellationToken::new())
            .await;

        assert!(result.error.is_none());
        assert!(result.settings.is_none());
        assert!(result.response.is_none());
        assert!(result.payload.is_none());
    }

    #[tokio::test]
    async fn test_missing_type_header_falls_back_to_first_subscriber() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let locator = SimpleLocator::new();
        locator.register_consumer(
            "base",
            Arc::new(CountingConsumer {
                invocations: Arc::clone(&invocations),
            }),
        );
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription)
            .with_subscriber(SubscriberSettings::consumer("SomeMessage", "base"));
        let fixture = fixture(endpoint, locator);

        let result = fixture
            .processor
            .process_message(inbound(r#"{}"#), Headers::new(), CancellationToken::new())
            .await;

        assert!(result.error.is_none());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_response_surfaces_when_responses_disabled() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let locator = SimpleLocator::new();
        locator.register_handler(
            "echo",
            Arc::new(EchoHandler {
                invocations: Arc::clone(&invocations),
            }),
        );
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription)
            .with_subscriber(SubscriberSettings::handler(
                "SomeRequest",
                "echo",
                "SomeResponse",
            ))
            .without_responses();
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "SomeRequest");
        headers.insert(well_known::REQUEST_ID, "r9");
        headers.insert(well_known::REPLY_TO, "q-reply");

        let result = fixture
            .processor
            .process_message(inbound(r#"{"message":"x"}"#), headers, CancellationToken::new())
            .await;

        assert_eq!(result.response, Some(json!({"message": "x"})));
        assert!(fixture.responder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_decode_failure_is_captured_not_thrown() {
        let locator = SimpleLocator::new();
        locator.register_consumer(
            "base",
            Arc::new(CountingConsumer {
                invocations: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let endpoint = EndpointDescriptor::new("t", EndpointKind::Subscription)
            .with_subscriber(SubscriberSettings::consumer("SomeMessage", "base"));
        let fixture = fixture(endpoint, locator);

        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "SomeMessage");

        let result = fixture
            .processor
            .process_message(inbound("not-json"), headers, CancellationToken::new())
            .await;

        assert!(matches!(result.error, Some(BusError::Serialization { .. })));
        assert!(result.settings.is_some());
    }
}
