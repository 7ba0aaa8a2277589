//! ABOUTME: Step handlers behind a common envelope of timeout and retry
//! ABOUTME: One handler per step type; the variant set is closed by design

mod agent_task;
mod approval;
mod gateway;
mod notification;
mod sub_process;
mod timer;

use crate::agents::AgentGateway;
use crate::approvals::ApprovalService;
use crate::pipeline::EventPipeline;
use crate::retry::backoff_delay;
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as Json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trinity_core::{
    AwaitKind, EngineConfig, EngineError, EventKind, Execution, ExecutionEvent, ExecutionId,
    Notifier, ProcessRef, Result, StepFailure, StepKind, StepSpec,
};
use trinity_expr::EvalContext;

/// Launches child executions for sub-process steps. Implemented by the
/// engine; the indirection keeps handlers below the engine in the layer
/// graph.
#[async_trait]
pub trait SubProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        parent: &Execution,
        process: &ProcessRef,
        input: Json,
    ) -> Result<ExecutionId>;
}

/// Everything a handler may touch. Handlers stay pure over this plus the
/// evaluation context; all persistence goes through the scheduler.
pub struct StepRuntime {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn StateStore>,
    pub gateway: Arc<AgentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub approvals: Arc<ApprovalService>,
    pub sub_processes: Arc<dyn SubProcessLauncher>,
    pub pipeline: Arc<EventPipeline>,
}

/// What one envelope run produced.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Succeeded {
        output: Json,
    },
    Failed {
        failure: StepFailure,
    },
    /// Suspended; the scheduler persists the wake instant and resumes on
    /// the external signal.
    Awaiting {
        awaiting: AwaitKind,
        wake_at: Option<DateTime<Utc>>,
    },
    Cancelled,
}

/// Run one step to its first outcome, applying the step's timeout and
/// retry policy. Returns the final attempt number alongside the outcome.
pub async fn run_step(
    runtime: &StepRuntime,
    execution: &Execution,
    step: &StepSpec,
    ctx: &EvalContext,
    cancel: &CancellationToken,
) -> (u32, StepOutcome) {
    match &step.kind {
        StepKind::Gateway { conditions } => {
            (1, gateway::run(step, conditions, ctx))
        }
        StepKind::Timer { duration_seconds } => (1, timer::run(*duration_seconds)),
        StepKind::HumanApproval {
            title,
            description,
            approvers,
            ..
        } => (
            1,
            approval::run(runtime, execution, step, title, description, approvers, ctx).await,
        ),
        StepKind::SubProcess {
            process,
            input_mapping,
        } => (
            1,
            sub_process::run(runtime, execution, step, process, input_mapping, ctx).await,
        ),
        StepKind::AgentTask { .. } | StepKind::Notification { .. } => {
            run_with_retry(runtime, execution, step, ctx, cancel).await
        }
    }
}

/// The retrying envelope for side-effecting handlers.
async fn run_with_retry(
    runtime: &StepRuntime,
    execution: &Execution,
    step: &StepSpec,
    ctx: &EvalContext,
    cancel: &CancellationToken,
) -> (u32, StepOutcome) {
    let max_attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
    let mut attempt = 1u32;

    loop {
        if cancel.is_cancelled() {
            return (attempt, StepOutcome::Cancelled);
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return (attempt, StepOutcome::Cancelled),
            result = attempt_once(runtime, execution, step, ctx, attempt) => result,
        };

        match result {
            Ok(output) => return (attempt, StepOutcome::Succeeded { output }),
            Err(error) if error.is_retriable() && attempt < max_attempts => {
                let delay = step.retry.as_ref().map_or(
                    std::time::Duration::from_secs(1),
                    |retry| backoff_delay(retry, attempt + 1),
                );
                debug!(
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "step attempt failed; retry scheduled"
                );
                runtime
                    .pipeline
                    .emit_lenient(ExecutionEvent::for_step(
                        execution.id,
                        EventKind::RetryScheduled,
                        &step.id,
                        json!({
                            "attempt": attempt + 1,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error.to_string(),
                        }),
                    ))
                    .await;
                attempt += 1;
                record_attempt(runtime, execution.id, &step.id, attempt);
                tokio::select! {
                    () = cancel.cancelled() => return (attempt, StepOutcome::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                return (
                    attempt,
                    StepOutcome::Failed {
                        failure: StepFailure::from_error(&error, &step.id, attempt),
                    },
                );
            }
        }
    }
}

async fn attempt_once(
    runtime: &StepRuntime,
    execution: &Execution,
    step: &StepSpec,
    ctx: &EvalContext,
    attempt: u32,
) -> Result<Json> {
    let step_timeout = step.timeout_or(runtime.config.default_step_timeout);
    match &step.kind {
        StepKind::AgentTask {
            agent,
            message,
            model,
            allowed_tools,
            roles,
        } => {
            agent_task::attempt(
                runtime,
                execution,
                step,
                agent,
                message,
                model.as_deref(),
                allowed_tools,
                roles,
                ctx,
                attempt,
                step_timeout,
            )
            .await
        }
        StepKind::Notification {
            channels,
            message,
            recipients,
        } => {
            // The envelope timeout covers the whole notification fan-out.
            match tokio::time::timeout(
                step_timeout,
                notification::attempt(runtime, step, channels, message, recipients, ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::StepTimeout {
                    step_id: step.id.clone(),
                    attempt,
                }),
            }
        }
        _ => Err(EngineError::Internal {
            message: format!("step '{}' is not retriable by kind", step.id),
        }),
    }
}

/// Persist a bumped attempt counter so observers see retry progress.
fn record_attempt(runtime: &StepRuntime, execution_id: ExecutionId, step_id: &str, attempt: u32) {
    if let Some(mut record) = runtime.store.step(execution_id, step_id) {
        record.attempt = attempt;
        let _ = runtime.store.upsert_step(record);
    }
}
