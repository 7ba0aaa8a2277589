//! ABOUTME: sub_process handler: map inputs, launch the child, mirror its fate

use super::{StepOutcome, StepRuntime};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use trinity_core::{AwaitKind, EngineError, Execution, FailureKind, ProcessRef, StepFailure, StepSpec};
use trinity_expr::{render_value, EvalContext};

pub(super) async fn run(
    runtime: &StepRuntime,
    execution: &Execution,
    step: &StepSpec,
    process: &ProcessRef,
    input_mapping: &BTreeMap<String, String>,
    ctx: &EvalContext,
) -> StepOutcome {
    if execution.depth + 1 > runtime.config.sub_process_max_depth {
        let err = EngineError::SubProcessTooDeep {
            max_depth: runtime.config.sub_process_max_depth,
        };
        return StepOutcome::Failed {
            failure: StepFailure::from_error(&err, &step.id, 1),
        };
    }

    let mut input = Map::new();
    for (key, template) in input_mapping {
        match render_value(template, ctx) {
            Ok(value) => {
                input.insert(key.clone(), value);
            }
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

    match runtime
        .sub_processes
        .launch(execution, process, Json::Object(input))
        .await
    {
        Ok(child_id) => StepOutcome::Awaiting {
            awaiting: AwaitKind::SubProcess { child_id },
            wake_at: None,
        },
        Err(err) => StepOutcome::Failed {
            failure: StepFailure::from_error(&err, &step.id, 1),
        },
    }
}
