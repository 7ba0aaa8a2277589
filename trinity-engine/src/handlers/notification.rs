//! ABOUTME: notification handler: at-least-once fan-out, succeeds when any channel accepts

use super::StepRuntime;
use futures::future::join_all;
use serde_json::{json, Value as Json};
use tracing::warn;
use trinity_core::{EngineError, Result, StepSpec};
use trinity_expr::{render, EvalContext};

pub(super) async fn attempt(
    runtime: &StepRuntime,
    step: &StepSpec,
    channels: &[String],
    message: &str,
    recipients: &[String],
    ctx: &EvalContext,
) -> Result<Json> {
    let resolved_message = render(message, ctx).map_err(|err| EngineError::Expression {
        step_id: step.id.clone(),
        message: err.to_string(),
    })?;

    // Channels are independent; fan out concurrently and join.
    let sends = channels.iter().map(|channel| {
        let message = resolved_message.as_str();
        async move {
            let result = runtime.notifier.send(channel, recipients, message).await;
            (channel.clone(), result)
        }
    });
    let outcomes = join_all(sends).await;

    let mut channel_results = serde_json::Map::new();
    let mut any_accepted = false;
    for (channel, result) in outcomes {
        match result {
            Ok(statuses) => {
                let accepted = statuses.iter().any(|s| s.accepted) || statuses.is_empty();
                any_accepted |= accepted;
                channel_results.insert(
                    channel,
                    json!({
                        "accepted": accepted,
                        "recipients": statuses,
                    }),
                );
            }
            Err(err) => {
                warn!(channel = %channel, step_id = %step.id, error = %err, "notification channel failed");
                channel_results.insert(
                    channel,
                    json!({ "accepted": false, "error": err.to_string() }),
                );
            }
        }
    }

    if any_accepted {
        Ok(Json::Object(channel_results))
    } else {
        Err(EngineError::NotificationFailed {
            step_id: step.id.clone(),
        })
    }
}
