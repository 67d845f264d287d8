//! Bus Topology Configuration
//!
//! Endpoints, subscribers and producers are declared as plain data and handed
//! to the bus; everything here is immutable after `MessageBus::start`.
//! Validation of the topology (checkpoint consistency, duplicate request
//! handlers) happens at startup and configuration errors are fatal.

use chrono::Duration;

use crate::checkpoint::CheckpointSettings;
use crate::error::{BusError, BusResult};

/// Kind of the channel an endpoint consumes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Topic subscription (one stream of messages per subscription)
    Subscription,
    /// Competing-consumer queue
    Queue,
    /// Partitioned log stream
    StreamPartition,
    /// In-process direct channel
    Direct,
}

/// Policy when the resolved message type matches none of the subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndeclaredTypePolicy {
    /// Silently skip the message
    Ignore,
    /// Surface a classified bus error
    Fail,
}

/// One subscriber registered on an endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberSettings {
    /// Declared message type name
    pub message_type: String,

    /// Factory key the target is resolved by from the service locator
    pub factory_key: String,

    /// Response type name; `Some` marks this subscriber as a request handler
    pub response_type: Option<String>,

    /// Whether to open a fresh resolution scope per inbound message
    pub per_message_scope: bool,

    /// Instance-count hint for the host's consumer pool
    pub instances: usize,

    /// Checkpoint cadence; must be identical across all subscribers sharing
    /// this endpoint's `(path, group)`
    pub checkpoint: Option<CheckpointSettings>,
}

impl SubscriberSettings {
    /// Declare a fire-and-forget consumer
    pub fn consumer(message_type: impl Into<String>, factory_key: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            factory_key: factory_key.into(),
            response_type: None,
            per_message_scope: false,
            instances: 1,
            checkpoint: None,
        }
    }

    /// Declare a request handler producing the named response type
    pub fn handler(
        message_type: impl Into<String>,
        factory_key: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        Self {
            response_type: Some(response_type.into()),
            ..Self::consumer(message_type, factory_key)
        }
    }

    /// Enable a fresh resolution scope per inbound message
    pub fn with_per_message_scope(mut self) -> Self {
        self.per_message_scope = true;
        self
    }

    /// Set the checkpoint cadence
    pub fn with_checkpoint(mut self, checkpoint: CheckpointSettings) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Set the instance-count hint
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Whether this subscriber is a request handler
    pub fn is_handler(&self) -> bool {
        self.response_type.is_some()
    }
}

/// A consumption endpoint: a channel plus its ordered subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDescriptor {
    /// Topic, queue or subject name
    pub path: String,

    /// Channel kind
    pub kind: EndpointKind,

    /// Consumer-group or subscription identifier
    pub group: Option<String>,

    /// Subscribers in declaration order; dispatch is serial in this order
    pub subscribers: Vec<SubscriberSettings>,

    /// What to do with messages whose resolved type matches no subscriber
    pub undeclared_policy: UndeclaredTypePolicy,

    /// Whether handlers emit responses on the caller's reply channel; when
    /// `false` the handler response is surfaced in the process result instead
    pub send_responses: bool,
}

impl EndpointDescriptor {
    /// Create an endpoint with no subscribers yet
    pub fn new(path: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            path: path.into(),
            kind,
            group: None,
            subscribers: Vec::new(),
            undeclared_policy: UndeclaredTypePolicy::Ignore,
            send_responses: true,
        }
    }

    /// Set the consumer group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Append a subscriber
    pub fn with_subscriber(mut self, subscriber: SubscriberSettings) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Set the undeclared-type policy
    pub fn with_undeclared_policy(mut self, policy: UndeclaredTypePolicy) -> Self {
        self.undeclared_policy = policy;
        self
    }

    /// Keep handler responses in the process result instead of emitting them
    pub fn without_responses(mut self) -> Self {
        self.send_responses = false;
        self
    }

    /// Reject endpoints where more than one handler is declared for the same
    /// request type
    pub fn verify_unique_handlers(&self) -> BusResult<()> {
        for (index, subscriber) in self.subscribers.iter().enumerate() {
            if !subscriber.is_handler() {
                continue;
            }
            let duplicate = self.subscribers[index + 1..]
                .iter()
                .any(|other| other.is_handler() && other.message_type == subscriber.message_type);
            if duplicate {
                return Err(BusError::configuration(format!(
                    "endpoint '{}' declares more than one handler for request type '{}'",
                    self.path, subscriber.message_type
                )));
            }
        }
        Ok(())
    }
}

/// Producer-side registration routing a message type to its default channel
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    /// Message type name this producer covers
    pub message_type: String,

    /// Channel the type is produced to unless overridden per call
    pub default_path: String,

    /// Expected response type; `Some` marks the type as a request
    pub response_type: Option<String>,

    /// Per-producer request timeout override
    pub timeout: Option<Duration>,
}

impl ProducerSettings {
    /// Declare a fire-and-forget producer
    pub fn publisher(message_type: impl Into<String>, default_path: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            default_path: default_path.into(),
            response_type: None,
            timeout: None,
        }
    }

    /// Declare a request producer expecting the named response type
    pub fn request(
        message_type: impl Into<String>,
        default_path: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        Self {
            response_type: Some(response_type.into()),
            ..Self::publisher(message_type, default_path)
        }
    }

    /// Set the per-producer request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Complete bus topology plus requester-side defaults
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Consumption endpoints
    pub endpoints: Vec<EndpointDescriptor>,

    /// Producer registrations
    pub producers: Vec<ProducerSettings>,

    /// Reply channel this bus instance receives responses on; required when
    /// any request producer is declared
    pub reply_path: Option<String>,

    /// Default timeout for `send` when neither the call nor the producer
    /// declares one
    pub default_request_timeout: Duration,

    /// Reaper tick interval for expired pending requests; bounded to at most
    /// one second
    pub reaper_interval: std::time::Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            producers: Vec::new(),
            reply_path: None,
            default_request_timeout: Duration::seconds(30),
            reaper_interval: std::time::Duration::from_millis(500),
        }
    }
}

impl BusConfig {
    /// Find the producer registration for a message type
    pub fn producer_for(&self, message_type: &str) -> Option<&ProducerSettings> {
        self.producers
            .iter()
            .find(|producer| producer.message_type == message_type)
    }

    /// Validate the topology; called by `MessageBus::start`
    pub fn verify(&self) -> BusResult<()> {
        for endpoint in &self.endpoints {
            if endpoint.subscribers.is_empty() {
                return Err(BusError::configuration(format!(
                    "endpoint '{}' declares no subscribers",
                    endpoint.path
                )));
            }
            endpoint.verify_unique_handlers()?;
        }

        let has_request_producer = self
            .producers
            .iter()
            .any(|producer| producer.response_type.is_some());
        if has_request_producer && self.reply_path.is_none() {
            return Err(BusError::configuration(
                "a reply path is required when request producers are declared",
            ));
        }

        if self.reaper_interval > std::time::Duration::from_secs(1) {
            return Err(BusError::configuration(
                "the reaper interval must not exceed one second",
            ));
        }

        Ok(())
    }
}
