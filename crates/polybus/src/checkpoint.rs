//! Checkpoint Trigger
//!
//! Decides when a partition consumer must commit its progress back to the
//! transport: after every `after` processed messages, or once `every` wall
//! clock time has elapsed since the last commit, whichever comes first.
//!
//! All consumers sharing a `(path, group)` must agree on the trigger
//! parameters, because the transport tracks a single committed position per
//! consumer group. [`verify_consistency`] enforces that at startup.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::EndpointDescriptor;
use crate::error::{BusError, BusResult};
use crate::time::Clock;

/// Checkpoint cadence parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSettings {
    /// Commit after this many processed messages
    pub after: u64,

    /// Commit once this much time has elapsed since the last commit
    pub every: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            after: 100,
            every: Duration::seconds(60),
        }
    }
}

impl fmt::Display for CheckpointSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{after: {}, every: {}}}", self.after, self.every)
    }
}

/// Counter-and-window checkpoint trigger
///
/// `increment` is called once per processed message and reports whether the
/// owning partition processor should commit now. The trigger does not reset
/// itself; the commit path calls `reset` after a successful commit.
pub struct CheckpointTrigger {
    settings: CheckpointSettings,
    clock: Arc<dyn Clock>,
    count: u64,
    window_start: DateTime<Utc>,
}

impl fmt::Debug for CheckpointTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointTrigger")
            .field("settings", &self.settings)
            .field("count", &self.count)
            .field("window_start", &self.window_start)
            .finish()
    }
}

impl CheckpointTrigger {
    /// Create a trigger with a fresh counter and window
    pub fn new(settings: CheckpointSettings, clock: Arc<dyn Clock>) -> Self {
        let window_start = clock.now();
        Self {
            settings,
            clock,
            count: 0,
            window_start,
        }
    }

    /// Build the trigger for an endpoint, if any of its subscribers declare
    /// checkpoint settings
    ///
    /// Subscribers on one endpoint share identical settings (enforced by
    /// [`verify_consistency`]), so the first declared value is taken.
    pub fn from_endpoint(endpoint: &EndpointDescriptor, clock: Arc<dyn Clock>) -> Option<Self> {
        endpoint
            .subscribers
            .iter()
            .find_map(|subscriber| subscriber.checkpoint)
            .map(|settings| Self::new(settings, clock))
    }

    /// Record one processed message; returns `true` when a commit is due
    pub fn increment(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.settings.after {
            return true;
        }
        self.clock.now() - self.window_start > self.settings.every
    }

    /// Clear the counter and restart the time window
    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = self.clock.now();
    }

    /// The configured cadence
    pub fn settings(&self) -> CheckpointSettings {
        self.settings
    }
}

/// Validate that all subscribers sharing a `(path, group)` declare identical
/// checkpoint settings
///
/// Fails startup with a configuration error enumerating the observed
/// configurations otherwise.
pub fn verify_consistency(endpoints: &[Arc<EndpointDescriptor>]) -> BusResult<()> {
    use std::collections::HashMap;

    let mut observed: HashMap<(String, Option<String>), Vec<Option<CheckpointSettings>>> =
        HashMap::new();

    for endpoint in endpoints {
        let key = (endpoint.path.clone(), endpoint.group.clone());
        let configs = observed.entry(key).or_default();
        for subscriber in &endpoint.subscribers {
            if !configs.contains(&subscriber.checkpoint) {
                configs.push(subscriber.checkpoint);
            }
        }
    }

    for ((path, group), configs) in observed {
        if configs.len() > 1 {
            let rendered: Vec<String> = configs
                .iter()
                .map(|config| match config {
                    Some(settings) => settings.to_string(),
                    None => "{none}".to_string(),
                })
                .collect();
            return Err(BusError::configuration(format!(
                "checkpoint settings must be identical for (path: {path}, group: {group:?}); observed: [{}]",
                rendered.join(", ")
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointKind, SubscriberSettings, UndeclaredTypePolicy};
    use crate::time::ManualClock;
    use proptest::prelude::*;

    fn trigger(after: u64, every_secs: i64, clock: &ManualClock) -> CheckpointTrigger {
        CheckpointTrigger::new(
            CheckpointSettings {
                after,
                every: Duration::seconds(every_secs),
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_fires_on_count() {
        let clock = ManualClock::starting_now();
        let mut trigger = trigger(3, 3600, &clock);

        assert!(!trigger.increment());
        assert!(!trigger.increment());
        assert!(trigger.increment());
    }

    #[test]
    fn test_fires_on_elapsed_time() {
        let clock = ManualClock::starting_now();
        let mut trigger = trigger(1000, 60, &clock);

        assert!(!trigger.increment());
        clock.advance(Duration::seconds(61));
        assert!(trigger.increment());
    }

    #[test]
    fn test_reset_clears_counter_and_window() {
        let clock = ManualClock::starting_now();
        let mut trigger = trigger(2, 60, &clock);

        assert!(!trigger.increment());
        assert!(trigger.increment());

        trigger.reset();
        clock.advance(Duration::seconds(59));
        assert!(!trigger.increment());
        assert!(trigger.increment());
    }

    fn endpoint_with(
        path: &str,
        group: Option<&str>,
        checkpoints: Vec<Option<CheckpointSettings>>,
    ) -> Arc<EndpointDescriptor> {
        Arc::new(EndpointDescriptor {
            path: path.to_string(),
            kind: EndpointKind::Subscription,
            group: group.map(str::to_string),
            subscribers: checkpoints
                .into_iter()
                .enumerate()
                .map(|(index, checkpoint)| SubscriberSettings {
                    message_type: format!("Message{index}"),
                    factory_key: format!("consumer-{index}"),
                    response_type: None,
                    per_message_scope: false,
                    instances: 1,
                    checkpoint,
                })
                .collect(),
            undeclared_policy: UndeclaredTypePolicy::Ignore,
            send_responses: true,
        })
    }

    #[test]
    fn test_consistency_accepts_identical_settings() {
        let settings = Some(CheckpointSettings::default());
        let endpoints = vec![
            endpoint_with("orders", Some("g1"), vec![settings, settings]),
            endpoint_with("orders", Some("g2"), vec![None]),
        ];

        assert!(verify_consistency(&endpoints).is_ok());
    }

    #[test]
    fn test_consistency_rejects_mismatch_and_enumerates() {
        let first = Some(CheckpointSettings {
            after: 10,
            every: Duration::seconds(60),
        });
        let second = Some(CheckpointSettings {
            after: 20,
            every: Duration::seconds(60),
        });
        let endpoints = vec![endpoint_with("orders", Some("g1"), vec![first, second])];

        let error = match verify_consistency(&endpoints) {
            Err(error) => error,
            Ok(()) => panic!("expected configuration error"),
        };
        let message = format!("{error}");
        assert!(message.contains("orders"));
        assert!(message.contains("after: 10"));
        assert!(message.contains("after: 20"));
    }

    #[test]
    fn test_consistency_rejects_none_vs_some() {
        let endpoints = vec![endpoint_with(
            "orders",
            Some("g1"),
            vec![Some(CheckpointSettings::default()), None],
        )];

        assert!(verify_consistency(&endpoints).is_err());
    }

    proptest! {
        /// The counter side always fires on the `after`-th increment when the
        /// window is far in the future.
        #[test]
        fn prop_counter_fires_exactly_at_after(after in 1u64..50) {
            let clock = ManualClock::starting_now();
            let mut trigger = CheckpointTrigger::new(
                CheckpointSettings { after, every: Duration::hours(24) },
                Arc::new(clock),
            );

            for _ in 0..after - 1 {
                prop_assert!(!trigger.increment());
            }
            prop_assert!(trigger.increment());
        }
    }
}
