//! ABOUTME: human_approval handler: create the task, suspend on the decision

use super::{StepOutcome, StepRuntime};
use chrono::Utc;
use trinity_core::{AwaitKind, Execution, StepFailure, StepSpec};
use trinity_expr::{render, EvalContext};

pub(super) async fn run(
    runtime: &StepRuntime,
    execution: &Execution,
    step: &StepSpec,
    title: &str,
    description: &str,
    approvers: &[String],
    ctx: &EvalContext,
) -> StepOutcome {
    let resolved_title = match render(title, ctx) {
        Ok(title) => title,
        Err(err) => return expression_failure(step, &err),
    };
    let resolved_description = match render(description, ctx) {
        Ok(description) => description,
        Err(err) => return expression_failure(step, &err),
    };

    let deadline = Utc::now()
        + chrono::Duration::from_std(step.timeout_or(runtime.config.default_step_timeout))
            .unwrap_or_else(|_| chrono::Duration::hours(24));

    match runtime
        .approvals
        .create(
            execution,
            &step.id,
            resolved_title,
            resolved_description,
            approvers.to_vec(),
            deadline,
        )
        .await
    {
        Ok(task) => StepOutcome::Awaiting {
            awaiting: AwaitKind::Approval { task_id: task.id },
            wake_at: Some(deadline),
        },
        Err(err) => StepOutcome::Failed {
            failure: StepFailure::from_error(&err, &step.id, 1),
        },
    }
}

fn expression_failure(step: &StepSpec, err: &trinity_expr::ExpressionError) -> StepOutcome {
    StepOutcome::Failed {
        failure: StepFailure {
            kind: trinity_core::FailureKind::Expression,
            message: err.to_string(),
            step_id: step.id.clone(),
            attempt: 1,
        },
    }
}
