//! ABOUTME: Execution, step execution, and approval task records
//! ABOUTME: Terminal statuses are write-once; transitions are guarded in code

use crate::definition::{DefinitionRef, TimeoutAction};
use crate::error::{EngineError, Result, StepFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use ulid::Ulid;
use uuid::Uuid;

/// Executions are identified by ULIDs: sortable, unique, copyable.
pub type ExecutionId = Ulid;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

/// What started an execution. Audit-grade: carries actor attribution all
/// the way through to agent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Manual,
    Webhook,
    Schedule,
    Agent,
}

/// Actor attribution attached to an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub kind: OriginKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_key_name: Option<String>,
}

impl Origin {
    #[must_use]
    pub fn manual(user_id: impl Into<String>, user_email: Option<String>) -> Self {
        Self {
            kind: OriginKind::Manual,
            user_id: Some(user_id.into()),
            user_email,
            source_agent: None,
            mcp_key_id: None,
            mcp_key_name: None,
        }
    }

    #[must_use]
    pub const fn webhook() -> Self {
        Self {
            kind: OriginKind::Webhook,
            user_id: None,
            user_email: None,
            source_agent: None,
            mcp_key_id: None,
            mcp_key_name: None,
        }
    }

    #[must_use]
    pub const fn schedule() -> Self {
        Self {
            kind: OriginKind::Schedule,
            user_id: None,
            user_email: None,
            source_agent: None,
            mcp_key_id: None,
            mcp_key_name: None,
        }
    }

    #[must_use]
    pub fn agent(source_agent: impl Into<String>) -> Self {
        Self {
            kind: OriginKind::Agent,
            user_id: None,
            user_email: None,
            source_agent: Some(source_agent.into()),
            mcp_key_id: None,
            mcp_key_name: None,
        }
    }

    /// Header map forwarded to agents for downstream audit.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(
            "x-trinity-origin".to_string(),
            match self.kind {
                OriginKind::Manual => "manual",
                OriginKind::Webhook => "webhook",
                OriginKind::Schedule => "schedule",
                OriginKind::Agent => "agent",
            }
            .to_string(),
        )];
        if let Some(user_id) = &self.user_id {
            headers.push(("x-trinity-user-id".to_string(), user_id.clone()));
        }
        if let Some(email) = &self.user_email {
            headers.push(("x-trinity-user-email".to_string(), email.clone()));
        }
        if let Some(agent) = &self.source_agent {
            headers.push(("x-trinity-source-agent".to_string(), agent.clone()));
        }
        if let Some(key_id) = &self.mcp_key_id {
            headers.push(("x-trinity-mcp-key-id".to_string(), key_id.clone()));
        }
        if let Some(key_name) = &self.mcp_key_name {
            headers.push(("x-trinity-mcp-key-name".to_string(), key_name.clone()));
        }
        headers
    }
}

/// One run of a process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub definition: DefinitionRef,
    pub status: ExecutionStatus,
    pub origin: Origin,
    pub input: Json,
    /// Trigger context exposed to expressions as `trigger.*`.
    pub trigger: Json,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    /// Sub-process nesting depth; 0 for top-level executions.
    #[serde(default)]
    pub depth: u32,
    /// Captured outputs, resolved at termination (best-effort on failure).
    #[serde(default)]
    pub outputs: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    #[must_use]
    pub fn new(definition: DefinitionRef, origin: Origin, input: Json, trigger: Json) -> Self {
        Self {
            id: Ulid::new(),
            definition,
            status: ExecutionStatus::Pending,
            origin,
            input,
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            parent_execution_id: None,
            depth: 0,
            outputs: Json::Null,
            error: None,
        }
    }

    #[must_use]
    pub fn as_child_of(mut self, parent: ExecutionId, depth: u32) -> Self {
        self.parent_execution_id = Some(parent);
        self.depth = depth;
        self
    }

    /// Move to a terminal status. Terminal statuses are write-once;
    /// a second transition is a conflict.
    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(EngineError::Conflict {
                message: format!("execution {} is already {:?}", self.id, self.status),
            });
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now);
        Ok(())
    }

    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

/// Status of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    /// Suspended on an approval decision, a timer, or a child execution.
    Awaiting,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether this terminal state satisfies a downstream join under the
    /// default all-succeeded-or-skipped policy.
    #[must_use]
    pub const fn satisfies_join(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::Awaiting)
    }

    /// Snake-case name as exposed to expressions via `steps.<id>.status`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Awaiting => "awaiting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What an awaiting step is suspended on. Persisted so recovery can
/// re-arm or resolve the suspension without an in-memory task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwaitKind {
    Approval { task_id: Uuid },
    Timer,
    SubProcess { child_id: ExecutionId },
}

/// Attempt-history record for one step of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: ExecutionId,
    pub step_id: String,
    pub status: StepStatus,
    /// 1-based attempt counter.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub output: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Persisted resumption instant for awaiting steps: timer fire-at or
    /// approval deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<AwaitKind>,
}

impl StepExecution {
    #[must_use]
    pub fn new(execution_id: ExecutionId, step_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempt: 1,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: Json::Null,
            error: None,
            wake_at: None,
            awaiting: None,
        }
    }

    /// Seal the record in a terminal status. Write-once.
    pub fn finish(
        &mut self,
        status: StepStatus,
        output: Json,
        error: Option<StepFailure>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(EngineError::Conflict {
                message: format!(
                    "step '{}' of {} is already {:?}",
                    self.step_id, self.execution_id, self.status
                ),
            });
        }
        self.status = status;
        self.output = output;
        self.error = error;
        self.completed_at = Some(now);
        self.awaiting = None;
        if let Some(started) = self.started_at {
            let millis = (now - started).num_milliseconds();
            self.duration_ms = u64::try_from(millis.max(0)).ok();
        }
        Ok(())
    }
}

/// Approval decision as submitted by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Status of an approval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A pending human decision, owned by its step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub step_id: String,
    pub title: String,
    pub description: String,
    pub approvers: Vec<String>,
    pub deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalTask {
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        step_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        approvers: Vec<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.into(),
            title: title.into(),
            description: description.into(),
            approvers,
            deadline,
            status: ApprovalStatus::Pending,
            decided_by: None,
            comments: None,
            decided_at: None,
        }
    }

    /// Record a decision. Fails if the task is no longer pending.
    pub fn decide(
        &mut self,
        decision: ApprovalDecision,
        decided_by: impl Into<String>,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict {
                message: format!("approval {} is already {:?}", self.id, self.status),
            });
        }
        self.status = match decision {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        };
        self.decided_by = Some(decided_by.into());
        self.comments = comments;
        self.decided_at = Some(now);
        Ok(())
    }

    /// Step output synthesized from the task's final state, honoring the
    /// step's `timeout_action` when the deadline expired undecided.
    #[must_use]
    pub fn step_output(&self, timeout_action: TimeoutAction) -> Json {
        let decision = match self.status {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => match timeout_action {
                TimeoutAction::Approve => "approved",
                TimeoutAction::Reject => "rejected",
                TimeoutAction::Skip => "expired",
            },
            ApprovalStatus::Pending | ApprovalStatus::Cancelled => "cancelled",
        };
        serde_json::json!({
            "decision": decision,
            "approved_by": self.decided_by,
            "comments": self.comments,
            "decided_at": self.decided_at.map(|t| t.to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution() -> Execution {
        Execution::new(
            DefinitionRef::new("demo", "1"),
            Origin::manual("u1", None),
            json!({"topic": "K"}),
            json!({"id": "start", "kind": "manual"}),
        )
    }

    #[test]
    fn terminal_status_is_write_once() {
        let mut exec = execution();
        exec.finish(ExecutionStatus::Succeeded, Utc::now()).unwrap();
        assert!(exec.completed_at.is_some());
        let err = exec.finish(ExecutionStatus::Failed, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn step_finish_records_duration() {
        let mut step = StepExecution::new(Ulid::new(), "research");
        step.started_at = Some(Utc::now() - chrono::Duration::milliseconds(250));
        step.status = StepStatus::Running;
        step.finish(StepStatus::Succeeded, json!("ok"), None, Utc::now())
            .unwrap();
        assert!(step.duration_ms.unwrap() >= 250);
        assert!(step
            .finish(StepStatus::Failed, json!(null), None, Utc::now())
            .is_err());
    }

    #[test]
    fn skipped_satisfies_join_like_succeeded() {
        assert!(StepStatus::Succeeded.satisfies_join());
        assert!(StepStatus::Skipped.satisfies_join());
        assert!(!StepStatus::Failed.satisfies_join());
        assert!(!StepStatus::Cancelled.satisfies_join());
    }

    #[test]
    fn approval_decide_is_single_shot() {
        let mut task = ApprovalTask::new(
            Ulid::new(),
            "review",
            "Review",
            "desc",
            vec!["alice@x".into()],
            Utc::now() + chrono::Duration::hours(24),
        );
        task.decide(ApprovalDecision::Approved, "alice@x", Some("lgtm".into()), Utc::now())
            .unwrap();
        assert_eq!(task.status, ApprovalStatus::Approved);
        assert!(task
            .decide(ApprovalDecision::Rejected, "bob@x", None, Utc::now())
            .is_err());
        let output = task.step_output(TimeoutAction::Skip);
        assert_eq!(output["decision"], json!("approved"));
        assert_eq!(output["approved_by"], json!("alice@x"));
    }

    #[test]
    fn expired_approval_output_honors_timeout_action() {
        let mut task = ApprovalTask::new(
            Ulid::new(),
            "review",
            "Review",
            "desc",
            vec![],
            Utc::now(),
        );
        task.status = ApprovalStatus::Expired;
        assert_eq!(
            task.step_output(TimeoutAction::Approve)["decision"],
            json!("approved")
        );
        assert_eq!(
            task.step_output(TimeoutAction::Reject)["decision"],
            json!("rejected")
        );
    }

    #[test]
    fn origin_headers_carry_attribution() {
        let origin = Origin::agent("coordinator");
        let headers = origin.headers();
        assert!(headers.contains(&("x-trinity-origin".into(), "agent".into())));
        assert!(headers.contains(&("x-trinity-source-agent".into(), "coordinator".into())));
    }

    #[test]
    fn child_execution_links_parent() {
        let parent = execution();
        let child = execution().as_child_of(parent.id, 2);
        assert_eq!(child.parent_execution_id, Some(parent.id));
        assert_eq!(child.depth, 2);
    }
}
