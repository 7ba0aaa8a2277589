//! ABOUTME: Append-only execution event stream types
//! ABOUTME: Globally sequenced, JSON payloads, audit priority derived from kind

use crate::execution::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Global sequence counter for event ordering.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Every lifecycle event the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionTimedOut,
    StepReady,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepCancelled,
    RetryScheduled,
    ApprovalCreated,
    ApprovalDecided,
    RecoveryAction,
    CircuitStateChanged,
}

impl EventKind {
    /// Dotted event-type name used for bus pattern matching.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionCancelled => "execution.cancelled",
            Self::ExecutionTimedOut => "execution.timed_out",
            Self::StepReady => "step.ready",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepSkipped => "step.skipped",
            Self::StepCancelled => "step.cancelled",
            Self::RetryScheduled => "step.retry_scheduled",
            Self::ApprovalCreated => "approval.created",
            Self::ApprovalDecided => "approval.decided",
            Self::RecoveryAction => "recovery.action",
            Self::CircuitStateChanged => "circuit.state_changed",
        }
    }

    /// Critical events are written to the audit backend synchronously and
    /// their failure refuses the originating operation.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::ExecutionStarted
                | Self::ExecutionCompleted
                | Self::ExecutionFailed
                | Self::ExecutionCancelled
                | Self::ExecutionTimedOut
                | Self::ApprovalDecided
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an execution's append-only event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub kind: EventKind,
    pub data: Json,
    pub timestamp: DateTime<Utc>,
    /// Monotonic across the process; orders events within a stream.
    pub sequence: u64,
}

impl ExecutionEvent {
    #[must_use]
    pub fn new(execution_id: ExecutionId, kind: EventKind, data: Json) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            kind,
            data,
            timestamp: Utc::now(),
            sequence: SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Event for a step-scoped occurrence; merges the step id into the data.
    #[must_use]
    pub fn for_step(
        execution_id: ExecutionId,
        kind: EventKind,
        step_id: &str,
        mut data: Json,
    ) -> Self {
        if let Json::Object(map) = &mut data {
            map.insert("step_id".to_string(), Json::String(step_id.to_string()));
        } else {
            data = serde_json::json!({ "step_id": step_id, "detail": data });
        }
        Self::new(execution_id, kind, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    #[test]
    fn sequence_is_monotonic() {
        let id = Ulid::new();
        let a = ExecutionEvent::new(id, EventKind::ExecutionStarted, json!({}));
        let b = ExecutionEvent::new(id, EventKind::StepStarted, json!({}));
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn step_events_carry_step_id() {
        let event = ExecutionEvent::for_step(
            Ulid::new(),
            EventKind::StepFailed,
            "analyze",
            json!({"attempt": 2}),
        );
        assert_eq!(event.data["step_id"], json!("analyze"));
        assert_eq!(event.data["attempt"], json!(2));
    }

    #[test]
    fn criticality_split() {
        assert!(EventKind::ExecutionFailed.is_critical());
        assert!(EventKind::ApprovalDecided.is_critical());
        assert!(!EventKind::StepStarted.is_critical());
        assert!(!EventKind::RetryScheduled.is_critical());
    }
}
