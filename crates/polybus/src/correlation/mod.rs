//! Request/Response Correlation
//!
//! Requester-side machinery for the `send` operation: request id issuance,
//! pending-request tracking, response correlation across arbitrary reply
//! channels, and expiry reaping.
//!
//! ## Architecture
//!
//! - `store.rs` - the `PendingRequestStore` and its background reaper
//! - `types.rs` - pending entries and request id generators
//! - `error.rs` - requester-side error taxonomy

pub mod error;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use error::{RequestError, RequestResult};
pub use store::{PendingRequestStore, PendingStoreConfig};
pub use types::{CounterIdGenerator, PendingRequest, RequestIdGenerator, UuidIdGenerator};
