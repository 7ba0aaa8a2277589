//! ABOUTME: gateway handler: first matching condition chooses the successor

use super::StepOutcome;
use serde_json::json;
use trinity_core::{EngineError, FailureKind, GatewayCondition, StepFailure, StepSpec};
use trinity_expr::{eval_condition, EvalContext};

pub(super) fn run(
    step: &StepSpec,
    conditions: &[GatewayCondition],
    ctx: &EvalContext,
) -> StepOutcome {
    let mut default_next: Option<&str> = None;
    for condition in conditions {
        if condition.default {
            default_next = Some(condition.next.as_str());
            continue;
        }
        let Some(expression) = &condition.expression else {
            continue;
        };
        match eval_condition(expression, ctx) {
            Ok(true) => {
                return StepOutcome::Succeeded {
                    output: json!({ "chosen_next": condition.next }),
                };
            }
            Ok(false) => {}
            Err(err) => {
                return StepOutcome::Failed {
                    failure: StepFailure {
                        kind: FailureKind::Expression,
                        message: err.to_string(),
                        step_id: step.id.clone(),
                        attempt: 1,
                    },
                };
            }
        }
    }
    default_next.map_or_else(
        || StepOutcome::Failed {
            failure: StepFailure::from_error(
                &EngineError::NoGatewayMatch {
                    step_id: step.id.clone(),
                },
                &step.id,
                1,
            ),
        },
        |next| StepOutcome::Succeeded {
            output: json!({ "chosen_next": next }),
        },
    )
}
