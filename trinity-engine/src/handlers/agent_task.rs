//! ABOUTME: agent_task handler: resolve templates, submit through the gateway

use super::StepRuntime;
use crate::agents::ResolvedAgentCall;
use serde_json::Value as Json;
use std::time::Duration;
use trinity_core::{EngineError, Execution, Result, StepSpec};
use trinity_expr::{render, EvalContext, ExpressionError};

#[allow(clippy::too_many_arguments)] // envelope passes the variant fields through
pub(super) async fn attempt(
    runtime: &StepRuntime,
    execution: &Execution,
    step: &StepSpec,
    agent: &str,
    message: &str,
    model: Option<&str>,
    allowed_tools: &[String],
    roles: &[String],
    ctx: &EvalContext,
    attempt: u32,
    timeout: Duration,
) -> Result<Json> {
    let expression_error = |err: ExpressionError| EngineError::Expression {
        step_id: step.id.clone(),
        message: err.to_string(),
    };

    let resolved_message = render(message, ctx).map_err(expression_error)?;
    let resolved_model = model
        .map(|model| render(model, ctx))
        .transpose()
        .map_err(expression_error)?;
    let resolved_tools = allowed_tools
        .iter()
        .map(|tool| render(tool, ctx))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(expression_error)?;

    let call = ResolvedAgentCall {
        agent: agent.to_string(),
        message: resolved_message,
        model: resolved_model,
        allowed_tools: resolved_tools,
        roles: roles.to_vec(),
        timeout,
    };
    let response = runtime.gateway.call(execution, &step.id, attempt, &call).await?;

    // Raw response as the output; structured access parses it lazily at
    // evaluation time when it happens to be JSON.
    Ok(Json::String(response.response))
}
