//! Metrics hook the registry calls on every mutation.
//!
//! Wiring to a real backend (StatsD, Prometheus, ...) is out of scope; this
//! module defines the trait boundary plus a logging-only implementation so
//! the rest of the system has somewhere to report through from day one.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hooks the registry invokes as connections and subscriptions come and go.
pub trait SubscriptionMetricsHandler: Send + Sync {
    fn increment_active_subscriptions(&self) {}
    fn decrement_active_subscriptions(&self, by: usize) {
        let _ = by;
    }
    fn set_active_connections(&self, count: usize) {
        let _ = count;
    }
}

/// Reference implementation: keeps running counters and logs transitions at
/// `trace` level. Good enough for the status timer (§4.4) to read from.
#[derive(Default)]
pub struct LoggingMetricsHandler {
    active_subscriptions: AtomicUsize,
    active_connections: AtomicUsize,
}

impl LoggingMetricsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

impl SubscriptionMetricsHandler for LoggingMetricsHandler {
    fn increment_active_subscriptions(&self) {
        let n = self.active_subscriptions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(active_subscriptions = n, "subscription added");
    }

    fn decrement_active_subscriptions(&self, by: usize) {
        let n = self
            .active_subscriptions
            .fetch_sub(by, Ordering::Relaxed)
            .saturating_sub(by);
        tracing::trace!(active_subscriptions = n, "subscription(s) removed");
    }

    fn set_active_connections(&self, count: usize) {
        self.active_connections.store(count, Ordering::Relaxed);
        tracing::trace!(active_connections = count, "connection count updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_increments_and_decrements() {
        let handler = LoggingMetricsHandler::new();
        handler.increment_active_subscriptions();
        handler.increment_active_subscriptions();
        assert_eq!(handler.active_subscriptions(), 2);
        handler.decrement_active_subscriptions(1);
        assert_eq!(handler.active_subscriptions(), 1);
    }

    #[test]
    fn connection_count_is_set_not_accumulated() {
        let handler = LoggingMetricsHandler::new();
        handler.set_active_connections(5);
        handler.set_active_connections(3);
        assert_eq!(handler.active_connections(), 3);
    }
}
