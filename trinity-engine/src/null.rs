//! ABOUTME: No-op collaborator implementations for tests and minimal deployments

use async_trait::async_trait;
use tracing::warn;
use trinity_core::{
    AgentCallError, AgentClient, AgentRequest, AgentResponse, ApprovalNotifier, ApprovalTask,
    AuditPriority, AuditSink, ExecutionEvent, Notifier, RecipientStatus,
};

/// Refuses every call; deployments without an agent fleet wire this in.
pub struct NullAgentClient;

#[async_trait]
impl AgentClient for NullAgentClient {
    async fn call_task(&self, request: AgentRequest) -> Result<AgentResponse, AgentCallError> {
        Err(AgentCallError::Permanent {
            status: None,
            message: format!("no agent client configured (agent '{}')", request.agent),
        })
    }

    async fn cancel_task(&self, _agent: &str, _idempotency_key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Accepts every notification without delivering anything.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(
        &self,
        channel: &str,
        recipients: &[String],
        _message: &str,
    ) -> anyhow::Result<Vec<RecipientStatus>> {
        warn!(channel, "null notifier dropping message");
        Ok(recipients
            .iter()
            .map(|r| RecipientStatus {
                recipient: r.clone(),
                accepted: true,
                detail: Some("dropped by null notifier".to_string()),
            })
            .collect())
    }
}

/// Swallows approver fan-out.
pub struct NullApprovalNotifier;

#[async_trait]
impl ApprovalNotifier for NullApprovalNotifier {
    async fn notify_approvers(&self, _task: &ApprovalTask) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Accepts every audit write.
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn log(&self, _event: &ExecutionEvent, _priority: AuditPriority) -> anyhow::Result<()> {
        Ok(())
    }
}
