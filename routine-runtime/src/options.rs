//! Engine, hub and worker configuration.

use routine_core::{MethodId, ServiceId, StatePolicy};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Delay before the first poll of a new hub subscription.
pub const FIRST_POLL_DELAY: Duration = Duration::from_millis(50);

/// Direct-channel replies the hub keeps for pollers.
pub const REPLY_CAPACITY: usize = 1024;

/// Engine-wide settings shared by every transition.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Where non-final state lives unless a method overrides it.
    pub state_policy: StatePolicy,
    /// Services whose calls are served on the caller's stack.
    pub direct_services: HashSet<ServiceId>,
    /// Local handlers invoked for each raised event, by topic.
    pub event_handlers: Vec<(String, MethodId)>,
}

impl EngineOptions {
    #[must_use]
    pub fn with_state_policy(mut self, policy: StatePolicy) -> Self {
        self.state_policy = policy;
        self
    }

    /// Serve calls to `service` over the synchronous-reply channel.
    #[must_use]
    pub fn with_direct_service(mut self, service: impl Into<String>) -> Self {
        self.direct_services.insert(ServiceId::new(service));
        self
    }

    /// Invoke `handler` with the payload of every event raised on `topic`.
    #[must_use]
    pub fn with_event_handler(mut self, topic: impl Into<String>, handler: MethodId) -> Self {
        self.event_handlers.push((topic.into(), handler));
        self
    }

    pub fn is_direct(&self, service: &ServiceId) -> bool {
        self.direct_services.contains(service)
    }

    pub fn handlers_for<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a MethodId> + 'a {
        self.event_handlers
            .iter()
            .filter(move |(t, _)| t == topic)
            .map(|(_, handler)| handler)
    }
}

/// Poll schedule of the completion hub.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub first_poll_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_exponent: f64,
    pub reply_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            first_poll_delay: FIRST_POLL_DELAY,
            backoff_base: Duration::from_millis(100),
            backoff_exponent: 1.6,
            reply_capacity: REPLY_CAPACITY,
        }
    }
}

impl HubOptions {
    #[must_use]
    pub fn with_first_poll_delay(mut self, delay: Duration) -> Self {
        self.first_poll_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, exponent: f64) -> Self {
        self.backoff_base = base;
        self.backoff_exponent = exponent;
        self
    }

    #[must_use]
    pub fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.reply_capacity = capacity;
        self
    }

    /// Wait after the `polls`-th unsuccessful poll: `polls^exponent * base`.
    pub fn poll_interval(&self, polls: u32) -> Duration {
        let factor = f64::from(polls.max(1)).powf(self.backoff_exponent);
        self.backoff_base.mul_f64(factor)
    }
}

/// Settings for a [`TransitionWorker`](crate::worker::TransitionWorker).
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub batch_size: NonZeroUsize,
    pub max_concurrency: NonZeroUsize,
    /// Attempts (including the first) before a retried message is dead-lettered.
    pub max_attempts: u32,
    /// Delay before a retried message becomes visible, scaled by the attempt.
    pub retry_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            poll_interval: Duration::from_millis(100),
            batch_size: NonZeroUsize::MIN,
            max_concurrency: NonZeroUsize::MIN,
            max_attempts: 5,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl WorkerOptions {
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of messages fetched per poll (default: 1).
    #[must_use]
    pub fn with_batch_size(mut self, size: NonZeroUsize) -> Self {
        self.batch_size = size;
        self
    }

    /// Maximum number of concurrent transitions (default: 1).
    #[must_use]
    pub fn with_max_concurrency(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrency = max;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(d: Duration) -> f64 {
        d.as_secs_f64() * 1000.0
    }

    #[test]
    fn poll_interval_follows_power_law() {
        let options = HubOptions::default();
        let intervals: Vec<f64> = (1..=3).map(|n| millis(options.poll_interval(n))).collect();

        assert!((intervals[0] - 100.0).abs() < 0.01);
        assert!((intervals[1] - 2f64.powf(1.6) * 100.0).abs() < 0.01);
        assert!((intervals[2] - 3f64.powf(1.6) * 100.0).abs() < 0.01);
        assert!(intervals[0] < intervals[1] && intervals[1] < intervals[2]);
        assert_eq!(options.first_poll_delay, Duration::from_millis(50));
    }

    #[test]
    fn event_handlers_by_topic() {
        let options = EngineOptions::default()
            .with_event_handler("order-placed", MethodId::new("Mail", "Confirm"))
            .with_event_handler("order-placed", MethodId::new("Audit", "Record"))
            .with_event_handler("order-shipped", MethodId::new("Mail", "Shipped"));

        assert_eq!(options.handlers_for("order-placed").count(), 2);
        assert_eq!(options.handlers_for("unknown").count(), 0);
    }
}
