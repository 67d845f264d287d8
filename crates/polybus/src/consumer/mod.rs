//! Consumption Engine
//!
//! Everything between a raw transport message and the application target:
//!
//! - `context.rs` - per-invocation context handed to targets
//! - `handler.rs` - the `MessageConsumer` and `RequestHandler` traits
//! - `processor.rs` - per-message dispatch (type resolution, scoping,
//!   interceptors, response production)
//! - `partition.rs` - per-partition lifecycle and checkpoint discipline

pub mod context;
pub mod handler;
pub mod partition;
pub mod processor;

// Re-export main types for convenience
pub use context::ConsumerContext;
pub use handler::{typed_consumer, typed_handler, MessageConsumer, RequestHandler};
pub use partition::{PartitionProcessor, PartitionState};
pub use processor::{MessageProcessor, ProcessResult, ResponseProducer};
