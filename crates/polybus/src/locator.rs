//! Service Locator
//!
//! Consumer and handler objects are owned by the host application, not by the
//! bus. The bus resolves them through a locator by their factory key, either
//! from the ambient scope (shared instances) or from a per-message scope that
//! lives for exactly one dispatch. Scope release happens on `Drop`, so it is
//! guaranteed on every exit path including errors and cancellation.

use std::sync::Arc;

use dashmap::DashMap;

use crate::consumer::{MessageConsumer, RequestHandler};

/// A resolved application target
#[derive(Clone)]
pub enum ConsumerInstance {
    /// Fire-and-forget consumer
    Consumer(Arc<dyn MessageConsumer>),
    /// Request handler producing a response
    Handler(Arc<dyn RequestHandler>),
}

impl std::fmt::Debug for ConsumerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer(_) => f.write_str("ConsumerInstance::Consumer"),
            Self::Handler(_) => f.write_str("ConsumerInstance::Handler"),
        }
    }
}

/// Host-provided resolver for application targets
pub trait ServiceLocator: Send + Sync {
    /// Resolve a target from the ambient scope
    fn resolve(&self, key: &str) -> Option<ConsumerInstance>;

    /// Open a fresh resolution scope for one message dispatch
    fn create_scope(&self) -> Box<dyn ServiceScope>;
}

/// A per-message resolution scope; dropping it releases scoped resources
pub trait ServiceScope: Send + Sync {
    /// Resolve a target within this scope
    fn resolve(&self, key: &str) -> Option<ConsumerInstance>;
}

/// Factory producing a fresh target instance
pub type ConsumerFactory = Arc<dyn Fn() -> ConsumerInstance + Send + Sync>;

/// Simple factory-backed locator for hosts without a dependency-injection
/// container
///
/// Ambient resolution caches one instance per key; scope resolution
/// constructs fresh instances, cached within the scope so all subscribers of
/// one dispatch observe the same object.
#[derive(Default)]
pub struct SimpleLocator {
    factories: Arc<DashMap<String, ConsumerFactory>>,
    singletons: DashMap<String, ConsumerInstance>,
}

impl SimpleLocator {
    /// Create an empty locator
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a key
    pub fn register<F>(&self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> ConsumerInstance + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Register a shared consumer instance under a key
    pub fn register_consumer(&self, key: impl Into<String>, consumer: Arc<dyn MessageConsumer>) {
        self.register(key, move || {
            ConsumerInstance::Consumer(Arc::clone(&consumer))
        });
    }

    /// Register a shared request handler instance under a key
    pub fn register_handler(&self, key: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.register(key, move || ConsumerInstance::Handler(Arc::clone(&handler)));
    }
}

impl ServiceLocator for SimpleLocator {
    fn resolve(&self, key: &str) -> Option<ConsumerInstance> {
        if let Some(instance) = self.singletons.get(key) {
            return Some(instance.clone());
        }
        let factory = self.factories.get(key)?;
        let instance = factory();
        self.singletons.insert(key.to_string(), instance.clone());
        Some(instance)
    }

    fn create_scope(&self) -> Box<dyn ServiceScope> {
        Box::new(SimpleScope {
            factories: Arc::clone(&self.factories),
            cache: DashMap::new(),
        })
    }
}

struct SimpleScope {
    factories: Arc<DashMap<String, ConsumerFactory>>,
    cache: DashMap<String, ConsumerInstance>,
}

impl ServiceScope for SimpleScope {
    fn resolve(&self, key: &str) -> Option<ConsumerInstance> {
        if let Some(instance) = self.cache.get(key) {
            return Some(instance.clone());
        }
        let factory = self.factories.get(key)?;
        let instance = factory();
        self.cache.insert(key.to_string(), instance.clone());
        Some(instance)
    }
}
