//! ABOUTME: Collaborator contracts the engine consumes but does not implement
//! ABOUTME: Agent calls, notifications, approval fan-out, and audit logging

use crate::events::ExecutionEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "testing")]
use mockall::automock;

/// A single task call to an external agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub agent: String,
    pub message: String,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub roles: Vec<String>,
    pub timeout: Duration,
    /// Derived from `(execution_id, step_id, attempt)` so agents can
    /// deduplicate at-least-once deliveries.
    pub idempotency_key: String,
    /// Execution origin attribution forwarded for downstream audit.
    pub origin_headers: Vec<(String, String)>,
}

/// Successful agent response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response: String,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Classified agent call failures. The engine maps these onto its retry
/// and circuit policies; the client only classifies.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentCallError {
    #[error("agent is busy")]
    Busy,
    #[error("agent call timed out")]
    Timeout,
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("permanent failure ({status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },
}

/// HTTP client for the agent fleet. Implementations live outside the
/// engine; the contract is one task call per lease plus best-effort cancel.
#[cfg_attr(feature = "testing", automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Issue one task call. The implementation enforces the request
    /// timeout against the transport and classifies failures.
    async fn call_task(&self, request: AgentRequest) -> Result<AgentResponse, AgentCallError>;

    /// Best-effort cancellation of an in-flight task; errors are logged
    /// and otherwise ignored.
    async fn cancel_task(&self, agent: &str, idempotency_key: &str) -> anyhow::Result<()>;
}

/// Delivery outcome for one recipient on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub recipient: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outbound notification channels (chat, email, webhooks...).
#[cfg_attr(feature = "testing", automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one message to one channel. A returned error means the whole
    /// channel failed and is retriable; per-recipient failures come back
    /// as statuses.
    async fn send(
        &self,
        channel: &str,
        recipients: &[String],
        message: &str,
    ) -> anyhow::Result<Vec<RecipientStatus>>;
}

/// Fan-out of newly created approval tasks to approvers. The engine stays
/// authoritative over task state and deadlines.
#[cfg_attr(feature = "testing", automock)]
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify_approvers(&self, task: &crate::execution::ApprovalTask) -> anyhow::Result<()>;
}

/// Audit write priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPriority {
    Critical,
    Normal,
}

/// Durable audit backend. Critical writes are retried synchronously; on
/// persistent failure the engine falls back to a local append-only file.
#[cfg_attr(feature = "testing", automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, event: &ExecutionEvent, priority: AuditPriority) -> anyhow::Result<()>;
}
