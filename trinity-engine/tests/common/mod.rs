//! Shared test doubles: scripted agent fleet, collecting notifier, helpers.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use trinity_core::{
    AgentCallError, AgentClient, AgentRequest, AgentResponse, ApprovalNotifier, ApprovalTask,
    Execution, ExecutionId, Notifier, RecipientStatus,
};
use trinity_engine::StateStore;

/// Scripted agent fleet. Each agent pops scripted results in order and
/// falls back to a default body; unknown agents fail permanently.
pub struct ScriptedFleet {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, AgentCallError>>>>,
    defaults: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<AgentRequest>>,
    pub delay: Duration,
}

impl ScriptedFleet {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call to `agent` answers `body` unless a script entry exists.
    pub fn respond(&self, agent: &str, body: &str) {
        self.defaults.lock().insert(agent.to_string(), body.to_string());
    }

    /// Queue one scripted result for `agent`.
    pub fn script(&self, agent: &str, result: Result<&str, AgentCallError>) {
        self.scripts
            .lock()
            .entry(agent.to_string())
            .or_default()
            .push_back(result.map(ToString::to_string));
    }

    pub fn calls_to(&self, agent: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.agent == agent).count()
    }
}

#[async_trait]
impl AgentClient for ScriptedFleet {
    async fn call_task(&self, request: AgentRequest) -> Result<AgentResponse, AgentCallError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().push(request.clone());
        let scripted = self
            .scripts
            .lock()
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(result) => result,
            None => self
                .defaults
                .lock()
                .get(&request.agent)
                .cloned()
                .ok_or_else(|| AgentCallError::Permanent {
                    status: Some(404),
                    message: format!("unknown agent '{}'", request.agent),
                }),
        };
        result.map(|body| AgentResponse {
            response: body,
            duration: self.delay,
            cost: None,
        })
    }

    async fn cancel_task(&self, _agent: &str, _idempotency_key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Notifier recording sends; channels listed in `failing` error out.
pub struct CollectingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
    pub failing: Mutex<Vec<String>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_channel(&self, channel: &str) {
        self.failing.lock().push(channel.to_string());
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(
        &self,
        channel: &str,
        recipients: &[String],
        message: &str,
    ) -> anyhow::Result<Vec<RecipientStatus>> {
        if self.failing.lock().iter().any(|c| c == channel) {
            anyhow::bail!("channel '{channel}' unavailable");
        }
        self.sent.lock().push((channel.to_string(), message.to_string()));
        Ok(recipients
            .iter()
            .map(|r| RecipientStatus {
                recipient: r.clone(),
                accepted: true,
                detail: None,
            })
            .collect())
    }
}

/// Approval notifier that records the tasks it saw.
pub struct CollectingApprovalNotifier {
    pub tasks: Mutex<Vec<ApprovalTask>>,
}

impl CollectingApprovalNotifier {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ApprovalNotifier for CollectingApprovalNotifier {
    async fn notify_approvers(&self, task: &ApprovalTask) -> anyhow::Result<()> {
        self.tasks.lock().push(task.clone());
        Ok(())
    }
}

/// Poll the store until the execution reaches a terminal status.
pub async fn wait_terminal(
    store: &Arc<dyn StateStore>,
    id: ExecutionId,
    timeout: Duration,
) -> Execution {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(execution) = store.execution(id) {
            if execution.status.is_terminal() {
                return execution;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {id} did not reach a terminal status in {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until an approval task exists for the execution.
pub async fn wait_approval(
    store: &Arc<dyn StateStore>,
    id: ExecutionId,
    timeout: Duration,
) -> ApprovalTask {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = store.approvals_for(id).into_iter().next() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no approval task appeared for {id} in {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
