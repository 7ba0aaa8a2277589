//! ABOUTME: Event pipeline: persist to the stream, publish to the bus, audit
//! ABOUTME: Persist-before-publish keeps dependents from observing unrecorded state

use std::sync::Arc;
use tracing::warn;
use trinity_core::{ExecutionEvent, Result};
use trinity_events::{AuditLog, EventBus};

use crate::store::StateStore;

/// Every engine event funnels through here in order: append to the
/// execution's stream, publish to subscribers, write to the audit backend.
pub struct EventPipeline {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    audit: AuditLog,
}

impl EventPipeline {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>, audit: AuditLog) -> Self {
        Self { store, bus, audit }
    }

    /// Emit an event. Fails only when the event is critical and the audit
    /// backend (including the local fallback path) refused it.
    pub async fn emit(&self, event: ExecutionEvent) -> Result<()> {
        self.store.append_event(event.clone());
        self.bus.publish(&event);
        self.audit.record(&event).await
    }

    /// Emit where the caller cannot usefully refuse (internal transitions);
    /// audit refusal is logged and swallowed.
    pub async fn emit_lenient(&self, event: ExecutionEvent) {
        let kind = event.kind;
        if let Err(err) = self.emit(event).await {
            warn!(event = %kind, error = %err, "audit refused event; continuing");
        }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}
