//! Bus Facade
//!
//! The top of the crate: hosts the registered endpoints, owns the pending
//! request store, exposes `publish` / `send` / `produce_response`, and
//! starts and stops the consumers.
//!
//! ## Architecture
//!
//! - `facade.rs` - the `MessageBus` and its builder
//! - `events.rs` - transport callback bindings driving partition processors
//!   and the reply-channel subscriber

pub(crate) mod events;
pub mod facade;

// Re-export main types for convenience
pub use facade::{BusState, MessageBus, MessageBusBuilder, PublishOptions, SendOptions};
