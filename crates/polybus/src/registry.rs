//! Type Registry
//!
//! The bus selects subscribers by nominal type compatibility: a subscriber
//! declared for type `D` receives every message whose resolved type is `D` or
//! a subtype of `D` (interface implementations count). Rust has no runtime
//! type graph, so the registry holds a user-supplied one: applications
//! register each message type together with the names of its supertypes and
//! implemented marker interfaces.
//!
//! Assignability is the transitive closure over those edges. Lookups are hot
//! (once per subscriber per message), so results are cached in a concurrent
//! map keyed by `(resolved, declared)`.

use std::sync::Arc;

use dashmap::DashMap;

/// Pluggable mapping between application type names and wire names
///
/// The wire name travels in the `message-type` header. The default resolver
/// uses the type name itself on both sides.
pub trait MessageTypeResolver: Send + Sync {
    /// Wire name for a registered type name
    fn to_wire(&self, type_name: &str) -> String;

    /// Type name for a wire name, or `None` if unknown to the resolver
    fn from_wire(&self, wire_name: &str) -> Option<String>;
}

/// Identity resolver: the wire name is the type name
#[derive(Debug, Default)]
pub struct DefaultTypeResolver;

impl MessageTypeResolver for DefaultTypeResolver {
    fn to_wire(&self, type_name: &str) -> String {
        type_name.to_string()
    }

    fn from_wire(&self, wire_name: &str) -> Option<String> {
        Some(wire_name.to_string())
    }
}

/// Cached nominal type graph
///
/// # Examples
///
/// ```rust
/// use polybus::registry::TypeRegistry;
///
/// let registry = TypeRegistry::new();
/// registry.register_type("CustomerEvent", &[]);
/// registry.register_type("OrderPlaced", &["CustomerEvent", "AuditedEvent"]);
///
/// assert!(registry.is_assignable("OrderPlaced", "CustomerEvent"));
/// assert!(registry.is_assignable("OrderPlaced", "OrderPlaced"));
/// assert!(!registry.is_assignable("CustomerEvent", "OrderPlaced"));
/// ```
#[derive(Debug, Default)]
pub struct TypeRegistry {
    /// Direct "is-a" edges: type name -> declared supertypes
    supertypes: DashMap<String, Vec<String>>,

    /// Memoized assignability results keyed by (resolved, declared)
    cache: DashMap<(String, String), bool>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared empty registry wrapped for bus construction
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a message type and its direct supertypes
    ///
    /// Registering the same type again replaces its edges; the cache is
    /// invalidated so later lookups see the new graph.
    pub fn register_type(&self, type_name: impl Into<String>, supertypes: &[&str]) {
        let type_name = type_name.into();
        self.supertypes.insert(
            type_name,
            supertypes.iter().map(|name| (*name).to_string()).collect(),
        );
        self.cache.clear();
    }

    /// Whether a message of `resolved` type may be handled by a subscriber
    /// declared for `declared`
    ///
    /// Reflexive, and transitive over registered supertype edges.
    pub fn is_assignable(&self, resolved: &str, declared: &str) -> bool {
        if resolved == declared {
            return true;
        }

        let key = (resolved.to_string(), declared.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return *cached;
        }

        let result = self.walk(resolved, declared, &mut Vec::new());
        self.cache.insert(key, result);
        result
    }

    /// Whether the type name is known to the registry
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.supertypes.contains_key(type_name)
    }

    fn walk(&self, current: &str, declared: &str, visited: &mut Vec<String>) -> bool {
        if visited.iter().any(|seen| seen == current) {
            return false;
        }
        visited.push(current.to_string());

        // Copy the edges out so no map guard is held across the recursion
        let Some(edges) = self.supertypes.get(current).map(|edges| edges.clone()) else {
            return false;
        };

        for supertype in &edges {
            if supertype == declared || self.walk(supertype, declared, visited) {
                return true;
            }
        }
        false
    }
}
