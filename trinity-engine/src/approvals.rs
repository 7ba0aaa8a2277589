//! ABOUTME: Approval task lifecycle: creation, decisions, expiry
//! ABOUTME: The engine is authoritative over state and deadlines; notifiers only fan out

use crate::auth::{Actor, Permission, Role};
use crate::pipeline::EventPipeline;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use trinity_core::{
    ApprovalDecision, ApprovalNotifier, ApprovalStatus, ApprovalTask, EngineError, EventKind,
    Execution, ExecutionEvent, ExecutionId, Result,
};
use uuid::Uuid;

/// Owns approval task state. Decisions are single-shot compare-and-set;
/// deadline expiry reconciles with the step's `timeout_action` upstream.
pub struct ApprovalService {
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn ApprovalNotifier>,
    pipeline: Arc<EventPipeline>,
}

impl ApprovalService {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn ApprovalNotifier>,
        pipeline: Arc<EventPipeline>,
    ) -> Self {
        Self {
            store,
            notifier,
            pipeline,
        }
    }

    /// Create a pending task and fan it out to approvers. Notification
    /// failures are logged; the deadline still governs.
    pub async fn create(
        &self,
        execution: &Execution,
        step_id: &str,
        title: String,
        description: String,
        approvers: Vec<String>,
        deadline: DateTime<Utc>,
    ) -> Result<ApprovalTask> {
        let task = ApprovalTask::new(
            execution.id,
            step_id,
            title,
            description,
            approvers,
            deadline,
        );
        self.store.insert_approval(task.clone())?;
        self.pipeline
            .emit_lenient(ExecutionEvent::for_step(
                execution.id,
                EventKind::ApprovalCreated,
                step_id,
                json!({
                    "approval_id": task.id,
                    "approvers": task.approvers,
                    "deadline": task.deadline.to_rfc3339(),
                }),
            ))
            .await;
        if let Err(err) = self.notifier.notify_approvers(&task).await {
            warn!(approval = %task.id, error = %err, "approver notification failed");
        }
        Ok(task)
    }

    /// Record a decision on a pending task. The actor must hold the
    /// decide permission and, when the task names approvers, be one of
    /// them (admins may override).
    pub async fn decide(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        comments: Option<String>,
        actor: &Actor,
    ) -> Result<ApprovalTask> {
        actor.require(Permission::DecideApproval)?;
        let current = self.store.approval(approval_id).ok_or_else(|| {
            EngineError::NotFound {
                message: format!("approval {approval_id}"),
            }
        })?;
        let is_named_approver = current.approvers.is_empty()
            || current.approvers.iter().any(|approver| {
                approver == &actor.id || actor.email.as_deref() == Some(approver.as_str())
            });
        if !is_named_approver && !actor.roles.contains(&Role::Admin) {
            return Err(EngineError::Unauthorized {
                message: format!("actor '{}' is not an approver", actor.id),
            });
        }

        let decided_by = actor.email.clone().unwrap_or_else(|| actor.id.clone());
        let task = self.store.update_approval(approval_id, &mut |task| {
            task.decide(decision, decided_by.clone(), comments.clone(), Utc::now())
        })?;

        self.pipeline
            .emit(ExecutionEvent::for_step(
                task.execution_id,
                EventKind::ApprovalDecided,
                &task.step_id,
                json!({
                    "approval_id": task.id,
                    "decision": task.status,
                    "decided_by": task.decided_by,
                    "comments": task.comments,
                }),
            ))
            .await?;
        Ok(task)
    }

    /// Expire a pending task whose deadline passed. Idempotent: an already
    /// decided task is returned unchanged.
    pub async fn expire(&self, approval_id: Uuid) -> Result<ApprovalTask> {
        let task = self.store.update_approval(approval_id, &mut |task| {
            if task.status == ApprovalStatus::Pending {
                task.status = ApprovalStatus::Expired;
                task.decided_at = Some(Utc::now());
            }
            Ok(())
        })?;
        Ok(task)
    }

    /// Cancel every pending task of an execution.
    pub fn cancel_for_execution(&self, execution_id: ExecutionId) -> Result<()> {
        for task in self.store.approvals_for(execution_id) {
            if task.status == ApprovalStatus::Pending {
                self.store.update_approval(task.id, &mut |task| {
                    task.status = ApprovalStatus::Cancelled;
                    task.decided_at = Some(Utc::now());
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}
