// ABOUTME: EventBus implementation with async pub/sub and pattern matching
// ABOUTME: Subscriptions match dotted event types with trailing-star globs

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use trinity_core::ExecutionEvent;
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 4096;

/// Event bus for publishing and subscribing to execution events.
///
/// Subscribers register a dotted pattern (`execution.*`, `step.failed`,
/// `*`) and receive matching events over an unbounded channel; the
/// broadcast firehose carries everything for websocket-style fan-out.
pub struct EventBus {
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,
    broadcast_tx: broadcast::Sender<ExecutionEvent>,
}

struct Subscription {
    #[allow(dead_code)] // retained for future unsubscribe support
    id: Uuid,
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            subscriptions: Arc::new(DashMap::new()),
            broadcast_tx,
        }
    }

    /// Publish an event to every matching subscriber and the firehose.
    pub fn publish(&self, event: &ExecutionEvent) {
        if self.broadcast_tx.send(event.clone()).is_err() {
            debug!("no broadcast receivers for event {}", event.kind);
        }
        self.route(event);
    }

    /// Subscribe to events whose type matches `pattern`.
    pub fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<ExecutionEvent>, SubscribeError> {
        if pattern.is_empty() {
            return Err(SubscribeError::InvalidPattern(pattern.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .entry(pattern.to_string())
            .or_default()
            .push(Subscription {
                id: Uuid::new_v4(),
                sender: tx,
            });
        Ok(rx)
    }

    /// A receiver over every event, regardless of type.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.broadcast_tx.subscribe()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.iter().map(|e| e.value().len()).sum()
    }

    fn route(&self, event: &ExecutionEvent) {
        let event_type = event.kind.as_str();
        let mut matched = 0usize;
        for entry in self.subscriptions.iter() {
            if pattern_matches(event_type, entry.key()) {
                for subscription in entry.value() {
                    if subscription.sender.send(event.clone()).is_ok() {
                        matched += 1;
                    } else {
                        debug!("dropped subscriber for pattern {}", entry.key());
                    }
                }
            }
        }
        debug!(event = event_type, matched, "event routed");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Dotted-name matcher: exact match, `*` for everything, or a trailing
/// `.*` segment glob (`execution.*` matches `execution.started`).
fn pattern_matches(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    pattern
        .strip_suffix(".*")
        .is_some_and(|prefix| {
            event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        })
}

/// Errors that can occur when subscribing.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trinity_core::EventKind;
    use ulid::Ulid;

    fn event(kind: EventKind) -> ExecutionEvent {
        ExecutionEvent::new(Ulid::new(), kind, json!({}))
    }

    #[tokio::test]
    async fn basic_pub_sub() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("execution.*").unwrap();

        bus.publish(&event(EventKind::ExecutionStarted));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::ExecutionStarted);
    }

    #[tokio::test]
    async fn patterns_partition_traffic() {
        let bus = EventBus::new();
        let mut exec_rx = bus.subscribe("execution.*").unwrap();
        let mut step_rx = bus.subscribe("step.*").unwrap();

        bus.publish(&event(EventKind::StepStarted));
        bus.publish(&event(EventKind::ExecutionCompleted));

        assert_eq!(step_rx.recv().await.unwrap().kind, EventKind::StepStarted);
        assert_eq!(
            exec_rx.recv().await.unwrap().kind,
            EventKind::ExecutionCompleted
        );
    }

    #[tokio::test]
    async fn firehose_sees_everything() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        bus.publish(&event(EventKind::RecoveryAction));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::RecoveryAction);
    }

    #[test]
    fn pattern_matching_rules() {
        assert!(pattern_matches("execution.started", "*"));
        assert!(pattern_matches("execution.started", "execution.*"));
        assert!(pattern_matches("execution.started", "execution.started"));
        assert!(!pattern_matches("execution.started", "step.*"));
        assert!(!pattern_matches("execution.started", "execution"));
        assert!(!pattern_matches("executionx.started", "execution.*"));
    }

    #[test]
    fn rejects_empty_pattern() {
        let bus = EventBus::new();
        assert!(bus.subscribe("").is_err());
    }
}
