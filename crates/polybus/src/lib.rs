//! Polybus - Transport-Agnostic Message Bus
//!
//! This crate unifies publish/subscribe and request/response messaging over
//! interchangeable broker transports. Application code declares typed
//! producers, consumers and request handlers against one configuration
//! surface; the bus routes messages by type, preserves per-partition
//! processing order where the transport offers it, correlates
//! request/response pairs across arbitrary reply channels, and applies an
//! ordered interceptor pipeline on both the produce and consume paths.
//!
//! # Architecture
//!
//! The crate is organized in layers:
//!
//! - **Transport Layer** (`transport`): broker adapter traits, the callback
//!   contract the core drives partitions with, and the in-memory loopback
//! - **Consumption Layer** (`consumer`): the per-message dispatch engine and
//!   the per-partition lifecycle with checkpoint discipline
//! - **Correlation Layer** (`correlation`): the requester-side pending
//!   request store with timeout reaping
//! - **Bus Layer** (`bus`): the facade exposing `publish`, `send` and the
//!   consumer lifecycle
//! - **Supporting modules**: typed headers (`headers`), the nominal type
//!   graph (`registry`), checkpoint cadence (`checkpoint`), payload
//!   serialization (`serialization`), the host service locator (`locator`),
//!   interceptors (`interceptor`), the substitutable clock (`time`) and the
//!   error taxonomy (`error`)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use polybus::bus::MessageBus;
//! use polybus::config::{
//!     BusConfig, EndpointDescriptor, EndpointKind, ProducerSettings, SubscriberSettings,
//! };
//! use polybus::consumer::typed_handler;
//! use polybus::locator::SimpleLocator;
//! use polybus::transport::MemoryTransport;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct EchoRequest {
//!     message: String,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct EchoResponse {
//!     message: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let locator = Arc::new(SimpleLocator::new());
//!     locator.register_handler(
//!         "echo-handler",
//!         typed_handler(|request: EchoRequest| async move {
//!             Ok(EchoResponse {
//!                 message: request.message,
//!             })
//!         }),
//!     );
//!
//!     let config = BusConfig {
//!         endpoints: vec![EndpointDescriptor::new("echo", EndpointKind::Queue)
//!             .with_subscriber(SubscriberSettings::handler(
//!                 "EchoRequest",
//!                 "echo-handler",
//!                 "EchoResponse",
//!             ))],
//!         producers: vec![ProducerSettings::request("EchoRequest", "echo", "EchoResponse")],
//!         reply_path: Some("echo-replies".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let bus = MessageBus::builder(config, MemoryTransport::shared())
//!         .locator(locator)
//!         .build()
//!         .await?;
//!     bus.start().await?;
//!
//!     let response: EchoResponse = bus
//!         .send(
//!             "EchoRequest",
//!             &EchoRequest {
//!                 message: "hello".to_string(),
//!             },
//!             None,
//!         )
//!         .await?;
//!     assert_eq!(response.message, "hello");
//!
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery Semantics
//!
//! The bus never re-orders messages within a partition and processes one
//! message at a time per partition. Delivery to handlers is at-least-once
//! except for expired requests, which are counted as delivered without the
//! handler being invoked. End-to-end exactly-once is not offered; it depends
//! on the transport.

pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod error;
pub mod headers;
pub mod interceptor;
pub mod locator;
pub mod registry;
pub mod serialization;
pub mod time;
pub mod transport;

// Re-export main types for convenience
pub use bus::{BusState, MessageBus, MessageBusBuilder, PublishOptions, SendOptions};
pub use checkpoint::{CheckpointSettings, CheckpointTrigger};
pub use config::{
    BusConfig, EndpointDescriptor, EndpointKind, ProducerSettings, SubscriberSettings,
    UndeclaredTypePolicy,
};
pub use consumer::{
    typed_consumer, typed_handler, ConsumerContext, MessageConsumer, MessageProcessor,
    PartitionProcessor, ProcessResult, RequestHandler,
};
pub use correlation::{PendingRequestStore, RequestError, RequestIdGenerator};
pub use error::{BusError, BusResult};
pub use headers::{well_known, HeaderCodec, HeaderValue, Headers};
pub use interceptor::{
    ConsumerChain, ConsumerInterceptor, InterceptorRegistry, ProducerChain, ProducerInterceptor,
};
pub use locator::{ConsumerInstance, ServiceLocator, ServiceScope, SimpleLocator};
pub use registry::{DefaultTypeResolver, MessageTypeResolver, TypeRegistry};
pub use serialization::{JsonSerializer, MessageProvider, MessageSerializer};
pub use time::{Clock, ManualClock, SystemClock};
pub use transport::{
    CheckpointCommitter, InboundMessage, MemoryTransport, PartitionId, TransportAdapter,
    TransportError, TransportEvents,
};
