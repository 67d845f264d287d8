//! Application Target Traits
//!
//! Targets receive the opaque message object (`serde_json::Value`); the
//! typed adapters wrap a `serde` round-trip around plain async functions so
//! application code works with concrete types.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::consumer::context::ConsumerContext;
use crate::error::{BusError, BusResult};

/// Fire-and-forget message consumer
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Handle one inbound message
    async fn on_handle(&self, message: Value, ctx: &ConsumerContext) -> BusResult<()>;
}

/// Request handler producing a response
///
/// The returned value is emitted on the caller's reply channel by the
/// dispatch engine; a returned error becomes an error response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound request and produce the response object
    async fn on_handle(&self, request: Value, ctx: &ConsumerContext) -> BusResult<Value>;
}

struct TypedConsumer<T, F> {
    handler: F,
    _message: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F, Fut> MessageConsumer for TypedConsumer<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = BusResult<()>> + Send,
{
    async fn on_handle(&self, message: Value, _ctx: &ConsumerContext) -> BusResult<()> {
        let typed: T = serde_json::from_value(message)
            .map_err(|error| BusError::serialization(error.to_string()))?;
        (self.handler)(typed).await
    }
}

/// Wrap an async function over a concrete message type as a consumer
pub fn typed_consumer<T, F, Fut>(handler: F) -> Arc<dyn MessageConsumer>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<()>> + Send + 'static,
{
    Arc::new(TypedConsumer {
        handler,
        _message: PhantomData,
    })
}

struct TypedHandler<TReq, TResp, F> {
    handler: F,
    _request: PhantomData<fn(TReq) -> TResp>,
}

#[async_trait]
impl<TReq, TResp, F, Fut> RequestHandler for TypedHandler<TReq, TResp, F>
where
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = BusResult<TResp>> + Send,
{
    async fn on_handle(&self, request: Value, _ctx: &ConsumerContext) -> BusResult<Value> {
        let typed: TReq = serde_json::from_value(request)
            .map_err(|error| BusError::serialization(error.to_string()))?;
        let response = (self.handler)(typed).await?;
        serde_json::to_value(response).map_err(|error| BusError::serialization(error.to_string()))
    }
}

/// Wrap an async function over concrete request/response types as a handler
pub fn typed_handler<TReq, TResp, F, Fut>(handler: F) -> Arc<dyn RequestHandler>
where
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<TResp>> + Send + 'static,
{
    Arc::new(TypedHandler {
        handler,
        _request: PhantomData,
    })
}
