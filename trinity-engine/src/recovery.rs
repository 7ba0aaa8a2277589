//! ABOUTME: Startup recovery sweep: age out, reset in-flight steps, resume
//! ABOUTME: Idempotent by construction; acts only on non-terminal rows whose condition holds

use crate::pipeline::EventPipeline;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use trinity_core::{
    EngineConfig, EventKind, Execution, ExecutionEvent, ExecutionStatus, StepStatus,
};

/// Summary of the last recovery sweep, kept for operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub executions_scanned: usize,
    pub executions_timed_out: usize,
    pub executions_resumed: usize,
    pub steps_reset: usize,
}

/// Classify every non-terminal execution, repair its step records, and
/// return the executions that should get a scheduler again.
pub(crate) async fn sweep(
    store: &Arc<dyn StateStore>,
    pipeline: &Arc<EventPipeline>,
    config: &EngineConfig,
) -> (RecoveryReport, Vec<Execution>) {
    let started_at = Utc::now();
    let max_age = chrono::Duration::from_std(config.max_execution_age)
        .unwrap_or_else(|_| chrono::Duration::hours(24));

    let candidates = store.non_terminal_executions();
    let executions_scanned = candidates.len();
    let mut executions_timed_out = 0usize;
    let mut steps_reset = 0usize;
    let mut resumable = Vec::new();

    for execution in candidates {
        if execution.age(started_at) > max_age {
            executions_timed_out += 1;
            age_out(store, pipeline, &execution).await;
            continue;
        }

        let mut reset_here = 0usize;
        for mut record in store.steps_for(execution.id) {
            if record.status == StepStatus::Running {
                // At-least-once: the scheduler re-dispatches; idempotency
                // is the agent's concern via the idempotency key.
                record.status = StepStatus::Pending;
                record.started_at = None;
                if store.upsert_step(record).is_err() {
                    warn!(execution = %execution.id, "failed to reset running step");
                } else {
                    reset_here += 1;
                }
            }
        }
        steps_reset += reset_here;

        pipeline
            .emit_lenient(ExecutionEvent::new(
                execution.id,
                EventKind::RecoveryAction,
                json!({
                    "action": "resume",
                    "steps_reset": reset_here,
                }),
            ))
            .await;
        resumable.push(execution);
    }

    let report = RecoveryReport {
        started_at,
        completed_at: Utc::now(),
        executions_scanned,
        executions_timed_out,
        executions_resumed: resumable.len(),
        steps_reset,
    };
    info!(
        scanned = report.executions_scanned,
        timed_out = report.executions_timed_out,
        resumed = report.executions_resumed,
        steps_reset = report.steps_reset,
        "recovery sweep complete"
    );
    (report, resumable)
}

async fn age_out(
    store: &Arc<dyn StateStore>,
    pipeline: &Arc<EventPipeline>,
    execution: &Execution,
) {
    let now = Utc::now();
    for mut record in store.steps_for(execution.id) {
        if record.status.is_in_flight() || record.status == StepStatus::Pending {
            if record
                .finish(StepStatus::Cancelled, serde_json::Value::Null, None, now)
                .is_ok()
            {
                let _ = store.upsert_step(record);
            }
        }
    }
    let aged = store.update_execution(execution.id, &mut |execution| {
        execution.finish(ExecutionStatus::TimedOut, now)
    });
    if let Err(err) = aged {
        warn!(execution = %execution.id, error = %err, "age-out failed");
        return;
    }
    pipeline
        .emit_lenient(ExecutionEvent::new(
            execution.id,
            EventKind::RecoveryAction,
            json!({ "action": "age_out" }),
        ))
        .await;
    pipeline
        .emit_lenient(ExecutionEvent::new(
            execution.id,
            EventKind::ExecutionTimedOut,
            json!({ "reason": "max execution age exceeded during recovery" }),
        ))
        .await;
}
