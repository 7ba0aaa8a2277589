//! ABOUTME: Per-execution scheduler: ready-set computation, gateway routing, joins
//! ABOUTME: Reactive single owner; every transition persists before dependents observe it

use crate::handlers::{run_step, StepOutcome, StepRuntime};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as Json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trinity_core::{
    AwaitKind, EventKind, Execution, ExecutionEvent, ExecutionId, ExecutionStatus,
    ProcessDefinition, StepExecution, StepFailure, StepKind, StepSpec, StepStatus, TimeoutAction,
};
use trinity_expr::{eval_condition, render_value, EvalContext, StepSnapshot};

/// Messages driving one execution's scheduler.
#[derive(Debug)]
pub(crate) enum SchedulerMsg {
    StepFinished {
        step_id: String,
        attempt: u32,
        outcome: StepOutcome,
    },
    ApprovalDecided {
        step_id: String,
    },
    ApprovalDeadline {
        step_id: String,
    },
    TimerFired {
        step_id: String,
    },
    SubProcessFinished {
        step_id: String,
        child_id: ExecutionId,
    },
    Cancel,
    AgeOut,
}

/// Handle the engine keeps per live execution.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    pub tx: mpsc::UnboundedSender<SchedulerMsg>,
    pub cancel: CancellationToken,
}

/// Callback into the engine when an execution reaches a terminal state.
#[async_trait]
pub(crate) trait CompletionSink: Send + Sync {
    async fn execution_finished(&self, execution: &Execution);
}

/// Static routing graph derived from the definition once per execution.
struct StepGraph {
    /// Source order, for stable dispatch tie-breaks.
    order: Vec<String>,
    /// depends_on plus the owning gateway of each gateway target.
    effective_deps: HashMap<String, Vec<String>>,
    /// Forward edges: dependency and gateway-next.
    successors: HashMap<String, Vec<String>>,
    /// Gateways anywhere in each step's ancestry.
    gateway_ancestors: HashMap<String, Vec<String>>,
}

impl StepGraph {
    fn build(definition: &ProcessDefinition) -> Self {
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut effective_deps: HashMap<String, Vec<String>> = HashMap::new();

        for step in &definition.steps {
            let deps = effective_deps.entry(step.id.clone()).or_default();
            for dep in &step.depends_on {
                deps.push(dep.clone());
            }
        }
        for step in &definition.steps {
            for dep in &step.depends_on {
                successors
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
            for target in step.gateway_targets() {
                successors
                    .entry(step.id.clone())
                    .or_default()
                    .push(target.to_string());
                let deps = effective_deps.entry(target.to_string()).or_default();
                if !deps.contains(&step.id) {
                    deps.push(step.id.clone());
                }
            }
        }

        // Reverse reachability gives each step its gateway ancestry.
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, tos) in &successors {
            for to in tos {
                reverse.entry(to.as_str()).or_default().push(from.as_str());
            }
        }
        let gateways: HashSet<&str> = definition
            .steps
            .iter()
            .filter(|s| s.is_gateway())
            .map(|s| s.id.as_str())
            .collect();
        let mut gateway_ancestors: HashMap<String, Vec<String>> = HashMap::new();
        for step in &definition.steps {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut queue: VecDeque<&str> =
                reverse.get(step.id.as_str()).cloned().unwrap_or_default().into();
            let mut found = Vec::new();
            while let Some(node) = queue.pop_front() {
                if !seen.insert(node) {
                    continue;
                }
                if gateways.contains(node) {
                    found.push(node.to_string());
                }
                if let Some(parents) = reverse.get(node) {
                    queue.extend(parents.iter().copied());
                }
            }
            gateway_ancestors.insert(step.id.clone(), found);
        }

        Self {
            order: definition.steps.iter().map(|s| s.id.clone()).collect(),
            effective_deps,
            successors,
            gateway_ancestors,
        }
    }

    /// Forward closure from a step, itself included.
    fn forward_closure(&self, from: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(nexts) = self.successors.get(&node) {
                queue.extend(nexts.iter().cloned());
            }
        }
        seen
    }
}

/// Drives one execution to a terminal state.
pub(crate) struct ExecutionScheduler {
    runtime: Arc<StepRuntime>,
    sink: Arc<dyn CompletionSink>,
    definition: Arc<ProcessDefinition>,
    execution_id: ExecutionId,
    graph: StepGraph,
    rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    cancel: CancellationToken,
    /// In-memory mirror of persisted step statuses.
    statuses: HashMap<String, StepStatus>,
    /// Gateway id -> forward closure of its chosen successor.
    chosen_routes: HashMap<String, HashSet<String>>,
    cancel_requested: bool,
    aged_out: bool,
    finished: bool,
}

impl ExecutionScheduler {
    pub(crate) fn spawn(
        runtime: Arc<StepRuntime>,
        sink: Arc<dyn CompletionSink>,
        definition: Arc<ProcessDefinition>,
        execution: &Execution,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = SchedulerHandle {
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let graph = StepGraph::build(&definition);
        let scheduler = Self {
            runtime,
            sink,
            definition,
            execution_id: execution.id,
            graph,
            rx,
            tx,
            cancel,
            statuses: HashMap::new(),
            chosen_routes: HashMap::new(),
            cancel_requested: false,
            aged_out: false,
            finished: false,
        };
        tokio::spawn(scheduler.run());
        handle
    }

    async fn run(mut self) {
        info!(execution = %self.execution_id, process = %self.definition.name, "scheduler started");
        self.arm_age_out();
        self.restore_persisted_state().await;
        if !self.finished {
            self.tick().await;
        }
        while !self.finished {
            let Some(msg) = self.rx.recv().await else {
                warn!(execution = %self.execution_id, "scheduler channel closed early");
                break;
            };
            self.handle(msg).await;
            if !self.finished {
                self.tick().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Startup / recovery reconciliation
    // ------------------------------------------------------------------

    /// Load persisted step records into the in-memory mirror, rebuild
    /// gateway routes, and re-arm (or immediately resolve) suspensions.
    async fn restore_persisted_state(&mut self) {
        let records = self.runtime.store.steps_for(self.execution_id);
        for record in records {
            self.statuses.insert(record.step_id.clone(), record.status);
            let Some(step) = self.definition.step(&record.step_id) else {
                continue;
            };
            if step.is_gateway() && record.status == StepStatus::Succeeded {
                if let Some(chosen) = record.output.get("chosen_next").and_then(Json::as_str) {
                    self.chosen_routes
                        .insert(record.step_id.clone(), self.graph.forward_closure(chosen));
                }
            }
            if record.status == StepStatus::Awaiting {
                match &record.awaiting {
                    Some(AwaitKind::Timer) => {
                        self.arm_wake(&record.step_id, record.wake_at, false);
                    }
                    Some(AwaitKind::Approval { .. }) => {
                        self.arm_wake(&record.step_id, record.wake_at, true);
                    }
                    Some(AwaitKind::SubProcess { child_id }) => {
                        // A terminal child resolves right away; otherwise the
                        // engine routes the child's completion back here.
                        if let Some(child) = self.runtime.store.execution(*child_id) {
                            if child.status.is_terminal() {
                                let _ = self.tx.send(SchedulerMsg::SubProcessFinished {
                                    step_id: record.step_id.clone(),
                                    child_id: *child_id,
                                });
                            }
                        }
                    }
                    None => {}
                }
            }
        }
    }

    fn arm_age_out(&self) {
        let Some(execution) = self.runtime.store.execution(self.execution_id) else {
            return;
        };
        let age_limit = chrono::Duration::from_std(self.runtime.config.max_execution_age)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let deadline = execution.started_at + age_limit;
        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(remaining) => {
                    let _ = tx.send(SchedulerMsg::AgeOut);
                }
            }
        });
    }

    /// Arm a wake-up for an awaiting step. Past-due instants fire at once.
    fn arm_wake(&self, step_id: &str, wake_at: Option<DateTime<Utc>>, is_approval: bool) {
        let Some(wake_at) = wake_at else { return };
        let remaining = (wake_at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let step_id = step_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(remaining) => {
                    let msg = if is_approval {
                        SchedulerMsg::ApprovalDeadline { step_id }
                    } else {
                        SchedulerMsg::TimerFired { step_id }
                    };
                    let _ = tx.send(msg);
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Ready-set computation and dispatch
    // ------------------------------------------------------------------

    fn status(&self, step_id: &str) -> StepStatus {
        self.statuses
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    /// A step is unreachable once any decided gateway in its ancestry
    /// routed away from it, or an ancestral gateway can no longer choose.
    fn is_unreachable(&self, step_id: &str) -> bool {
        let Some(gateways) = self.graph.gateway_ancestors.get(step_id) else {
            return false;
        };
        for gateway in gateways {
            match self.status(gateway) {
                StepStatus::Succeeded => {
                    if let Some(route) = self.chosen_routes.get(gateway) {
                        if !route.contains(step_id) {
                            return true;
                        }
                    }
                }
                StepStatus::Skipped | StepStatus::Cancelled => return true,
                _ => {}
            }
        }
        false
    }

    async fn tick(&mut self) {
        loop {
            let mut changed = false;
            for step_id in &self.graph.order.clone() {
                if self.status(step_id) != StepStatus::Pending {
                    continue;
                }
                let Some(step) = self.definition.step(step_id).cloned() else {
                    continue;
                };

                // Skip as soon as unreachability is decidable, without
                // waiting for dependencies; diamond joins rely on this.
                if self.is_unreachable(step_id) {
                    self.skip_step(&step, "not on chosen gateway route").await;
                    changed = true;
                    continue;
                }

                let deps = self
                    .graph
                    .effective_deps
                    .get(step_id)
                    .cloned()
                    .unwrap_or_default();
                if !deps.iter().all(|dep| self.status(dep).is_terminal()) {
                    continue;
                }
                if let Some(bad) = deps.iter().find(|dep| !self.status(dep).satisfies_join()) {
                    self.fail_dependency(&step, bad).await;
                    changed = true;
                    continue;
                }

                if let Some(condition) = step.condition.clone() {
                    let ctx = self.eval_context();
                    match eval_condition(&condition, &ctx) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.skip_step(&step, "condition evaluated false").await;
                            changed = true;
                            continue;
                        }
                        Err(err) => {
                            self.fail_step_inline(
                                &step,
                                StepFailure {
                                    kind: trinity_core::FailureKind::Expression,
                                    message: err.to_string(),
                                    step_id: step.id.clone(),
                                    attempt: 1,
                                },
                            )
                            .await;
                            changed = true;
                            continue;
                        }
                    }
                }

                if !self.cancel_requested && !self.aged_out {
                    self.dispatch(&step).await;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        if self.quiescent() {
            self.finalize().await;
        }
    }

    fn quiescent(&self) -> bool {
        // Nothing in flight, and nothing pending that could still start.
        if self
            .statuses
            .values()
            .any(|status| status.is_in_flight())
        {
            return false;
        }
        if self.cancel_requested || self.aged_out {
            return true;
        }
        self.graph
            .order
            .iter()
            .all(|step_id| self.status(step_id) != StepStatus::Pending)
    }

    async fn dispatch(&mut self, step: &StepSpec) {
        let now = Utc::now();
        let mut record = self
            .runtime
            .store
            .step(self.execution_id, &step.id)
            .unwrap_or_else(|| StepExecution::new(self.execution_id, &step.id));
        record.status = StepStatus::Running;
        record.started_at = Some(now);
        record.wake_at = None;
        record.awaiting = None;
        let attempt = record.attempt;
        if self.runtime.store.upsert_step(record).is_err() {
            warn!(step = %step.id, "failed to persist step dispatch");
        }
        self.statuses.insert(step.id.clone(), StepStatus::Running);

        self.emit_step(EventKind::StepReady, &step.id, json!({})).await;
        self.emit_step(
            EventKind::StepStarted,
            &step.id,
            json!({ "attempt": attempt, "type": step.kind.type_name() }),
        )
        .await;

        let Some(execution) = self.runtime.store.execution(self.execution_id) else {
            return;
        };
        let ctx = self.eval_context();
        let runtime = Arc::clone(&self.runtime);
        let tx = self.tx.clone();
        let cancel = self.cancel.child_token();
        let step = step.clone();
        tokio::spawn(async move {
            let (attempt, outcome) = run_step(&runtime, &execution, &step, &ctx, &cancel).await;
            let _ = tx.send(SchedulerMsg::StepFinished {
                step_id: step.id,
                attempt,
                outcome,
            });
        });
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    async fn skip_step(&mut self, step: &StepSpec, reason: &str) {
        debug!(execution = %self.execution_id, step = %step.id, reason, "step skipped");
        self.seal_step(step, StepStatus::Skipped, Json::Null, None).await;
        self.emit_step(EventKind::StepSkipped, &step.id, json!({ "reason": reason }))
            .await;
    }

    async fn fail_dependency(&mut self, step: &StepSpec, dependency: &str) {
        let failure = StepFailure::from_error(
            &trinity_core::EngineError::DependencyFailed {
                step_id: step.id.clone(),
                dependency: dependency.to_string(),
            },
            &step.id,
            1,
        );
        self.fail_step_inline(step, failure).await;
    }

    async fn fail_step_inline(&mut self, step: &StepSpec, failure: StepFailure) {
        self.seal_step(step, StepStatus::Failed, Json::Null, Some(failure.clone()))
            .await;
        self.emit_step(
            EventKind::StepFailed,
            &step.id,
            json!({ "kind": failure.kind, "error": failure.message, "attempt": failure.attempt }),
        )
        .await;
    }

    /// Persist a terminal step transition and mirror it in memory.
    async fn seal_step(
        &mut self,
        step: &StepSpec,
        status: StepStatus,
        output: Json,
        error: Option<StepFailure>,
    ) {
        let now = Utc::now();
        let mut record = self
            .runtime
            .store
            .step(self.execution_id, &step.id)
            .unwrap_or_else(|| StepExecution::new(self.execution_id, &step.id));
        if let Err(err) = record.finish(status, output.clone(), error, now) {
            warn!(step = %step.id, error = %err, "terminal transition rejected");
            return;
        }
        if self.runtime.store.upsert_step(record).is_err() {
            warn!(step = %step.id, "failed to persist step transition");
        }
        self.statuses.insert(step.id.clone(), status);

        if step.is_gateway() && status == StepStatus::Succeeded {
            if let Some(chosen) = output.get("chosen_next").and_then(Json::as_str) {
                debug!(gateway = %step.id, chosen, "gateway routed");
                self.chosen_routes
                    .insert(step.id.clone(), self.graph.forward_closure(chosen));
            }
        }
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::StepFinished {
                step_id,
                attempt,
                outcome,
            } => self.on_step_finished(&step_id, attempt, outcome).await,
            SchedulerMsg::ApprovalDecided { step_id } => {
                self.resolve_approval(&step_id, false).await;
            }
            SchedulerMsg::ApprovalDeadline { step_id } => {
                self.resolve_approval(&step_id, true).await;
            }
            SchedulerMsg::TimerFired { step_id } => self.on_timer_fired(&step_id).await,
            SchedulerMsg::SubProcessFinished { step_id, child_id } => {
                self.on_sub_process_finished(&step_id, child_id).await;
            }
            SchedulerMsg::Cancel => self.on_cancel(false).await,
            SchedulerMsg::AgeOut => self.on_cancel(true).await,
        }
    }

    async fn on_step_finished(&mut self, step_id: &str, attempt: u32, outcome: StepOutcome) {
        let Some(step) = self.definition.step(step_id).cloned() else {
            return;
        };
        if self.status(step_id).is_terminal() {
            // Late completion after cancellation sealed the record.
            return;
        }
        match outcome {
            StepOutcome::Succeeded { output } => {
                self.seal_step(&step, StepStatus::Succeeded, output, None).await;
                let mut data = json!({ "attempt": attempt, "type": step.kind.type_name() });
                if let Some(source_agent) = self
                    .runtime
                    .store
                    .execution(self.execution_id)
                    .and_then(|e| e.origin.source_agent)
                {
                    // Agent-originated executions emit collaboration context.
                    data["source_agent"] = Json::String(source_agent);
                }
                self.emit_step(EventKind::StepCompleted, step_id, data).await;
            }
            StepOutcome::Failed { failure } => {
                self.fail_step_inline(&step, failure).await;
            }
            StepOutcome::Cancelled => {
                self.seal_step(&step, StepStatus::Cancelled, Json::Null, None).await;
                self.emit_step(EventKind::StepCancelled, step_id, json!({})).await;
            }
            StepOutcome::Awaiting { awaiting, wake_at } => {
                let mut record = self
                    .runtime
                    .store
                    .step(self.execution_id, step_id)
                    .unwrap_or_else(|| StepExecution::new(self.execution_id, step_id));
                record.status = StepStatus::Awaiting;
                record.wake_at = wake_at;
                record.awaiting = Some(awaiting.clone());
                if self.runtime.store.upsert_step(record).is_err() {
                    warn!(step = %step_id, "failed to persist awaiting state");
                }
                self.statuses.insert(step_id.to_string(), StepStatus::Awaiting);
                match awaiting {
                    AwaitKind::Timer => self.arm_wake(step_id, wake_at, false),
                    AwaitKind::Approval { task_id } => {
                        self.arm_wake(step_id, wake_at, true);
                        // The decision may have landed before the awaiting
                        // state was persisted; replay it.
                        if self
                            .runtime
                            .store
                            .approval(task_id)
                            .is_some_and(|t| t.status != trinity_core::ApprovalStatus::Pending)
                        {
                            let _ = self.tx.send(SchedulerMsg::ApprovalDecided {
                                step_id: step_id.to_string(),
                            });
                        }
                    }
                    AwaitKind::SubProcess { child_id } => {
                        // Same race against a fast child execution.
                        if self
                            .runtime
                            .store
                            .execution(child_id)
                            .is_some_and(|c| c.status.is_terminal())
                        {
                            let _ = self.tx.send(SchedulerMsg::SubProcessFinished {
                                step_id: step_id.to_string(),
                                child_id,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn on_timer_fired(&mut self, step_id: &str) {
        let Some(step) = self.definition.step(step_id).cloned() else {
            return;
        };
        let record = self.runtime.store.step(self.execution_id, step_id);
        let awaiting_timer = record
            .as_ref()
            .is_some_and(|r| r.status == StepStatus::Awaiting && r.awaiting == Some(AwaitKind::Timer));
        if !awaiting_timer {
            return;
        }
        let fired_at = record
            .and_then(|r| r.wake_at)
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        self.seal_step(&step, StepStatus::Succeeded, json!({ "fired_at": fired_at }), None)
            .await;
        self.emit_step(EventKind::StepCompleted, step_id, json!({ "fired_at": fired_at }))
            .await;
    }

    /// Resolve an awaiting approval step, either from a decision or from
    /// its deadline passing.
    async fn resolve_approval(&mut self, step_id: &str, deadline: bool) {
        let Some(step) = self.definition.step(step_id).cloned() else {
            return;
        };
        let record = self.runtime.store.step(self.execution_id, step_id);
        let Some(record) = record else { return };
        if record.status != StepStatus::Awaiting {
            return;
        }
        let Some(AwaitKind::Approval { task_id }) = record.awaiting else {
            return;
        };

        let timeout_action = match &step.kind {
            StepKind::HumanApproval { timeout_action, .. } => *timeout_action,
            _ => TimeoutAction::Skip,
        };

        if deadline {
            match self.runtime.approvals.expire(task_id).await {
                Ok(task) if task.status == trinity_core::ApprovalStatus::Expired => {}
                // Decided just before the deadline; the decision message
                // is already queued behind this one.
                _ => return,
            }
        }

        let Some(task) = self.runtime.store.approval(task_id) else {
            return;
        };

        if task.status == trinity_core::ApprovalStatus::Expired
            && timeout_action == TimeoutAction::Skip
        {
            self.skip_step(&step, "approval expired").await;
            return;
        }
        let output = task.step_output(timeout_action);
        self.seal_step(&step, StepStatus::Succeeded, output.clone(), None).await;
        self.emit_step(
            EventKind::StepCompleted,
            step_id,
            json!({ "decision": output.get("decision") }),
        )
        .await;
    }

    async fn on_sub_process_finished(&mut self, step_id: &str, child_id: ExecutionId) {
        let Some(step) = self.definition.step(step_id).cloned() else {
            return;
        };
        let record = self.runtime.store.step(self.execution_id, step_id);
        let awaiting_child = record.as_ref().is_some_and(|r| {
            r.status == StepStatus::Awaiting
                && matches!(r.awaiting, Some(AwaitKind::SubProcess { child_id: c }) if c == child_id)
        });
        if !awaiting_child {
            return;
        }
        let Some(child) = self.runtime.store.execution(child_id) else {
            return;
        };
        match child.status {
            ExecutionStatus::Succeeded => {
                self.seal_step(&step, StepStatus::Succeeded, child.outputs.clone(), None)
                    .await;
                self.emit_step(
                    EventKind::StepCompleted,
                    step_id,
                    json!({ "child_execution_id": child_id.to_string() }),
                )
                .await;
            }
            status => {
                let failure = StepFailure {
                    kind: trinity_core::FailureKind::Internal,
                    message: format!("child execution {child_id} ended {}", status_name(status)),
                    step_id: step_id.to_string(),
                    attempt: 1,
                };
                self.fail_step_inline(&step, failure).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation, age-out, finalization
    // ------------------------------------------------------------------

    async fn on_cancel(&mut self, aged_out: bool) {
        if self.cancel_requested || self.aged_out {
            return;
        }
        if aged_out {
            self.aged_out = true;
        } else {
            self.cancel_requested = true;
        }
        info!(execution = %self.execution_id, aged_out, "terminating execution");

        // Awaiting steps cancel immediately; approval tasks with them.
        let _ = self.runtime.approvals.cancel_for_execution(self.execution_id);
        for step_id in &self.graph.order.clone() {
            if self.status(step_id) == StepStatus::Awaiting {
                if let Some(step) = self.definition.step(step_id).cloned() {
                    self.seal_step(&step, StepStatus::Cancelled, Json::Null, None).await;
                    self.emit_step(EventKind::StepCancelled, step_id, json!({})).await;
                }
            }
        }

        // Signal running handlers and issue best-effort agent cancels.
        self.cancel.cancel();
        if let Some(execution) = self.runtime.store.execution(self.execution_id) {
            for step_id in &self.graph.order.clone() {
                if self.status(step_id) == StepStatus::Running {
                    if let Some(StepSpec {
                        kind: StepKind::AgentTask { agent, .. },
                        ..
                    }) = self.definition.step(step_id)
                    {
                        let attempt = self
                            .runtime
                            .store
                            .step(self.execution_id, step_id)
                            .map_or(1, |r| r.attempt);
                        self.runtime
                            .gateway
                            .cancel(agent, &execution, step_id, attempt)
                            .await;
                    }
                }
            }
        }

        // Grace period: collect whatever outcomes still arrive.
        let grace = self.runtime.config.cancel_grace;
        let deadline = tokio::time::Instant::now() + grace;
        while self.statuses.values().any(|s| *s == StepStatus::Running) {
            let msg = tokio::select! {
                () = tokio::time::sleep_until(deadline) => break,
                msg = self.rx.recv() => msg,
            };
            match msg {
                Some(msg) => self.handle_terminal_phase(msg).await,
                None => break,
            }
        }

        // Anything still running is sealed cancelled.
        for step_id in &self.graph.order.clone() {
            if self.status(step_id).is_in_flight() {
                if let Some(step) = self.definition.step(step_id).cloned() {
                    self.seal_step(&step, StepStatus::Cancelled, Json::Null, None).await;
                    self.emit_step(EventKind::StepCancelled, step_id, json!({})).await;
                }
            }
        }

        self.finalize().await;
    }

    /// Message handling during the cancellation grace period: step results
    /// still seal records, everything else is dropped.
    async fn handle_terminal_phase(&mut self, msg: SchedulerMsg) {
        if let SchedulerMsg::StepFinished {
            step_id,
            attempt,
            outcome,
        } = msg
        {
            self.on_step_finished(&step_id, attempt, outcome).await;
        }
    }

    async fn finalize(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let failed_step = self
            .runtime
            .store
            .steps_for(self.execution_id)
            .into_iter()
            .find(|s| s.status == StepStatus::Failed);

        let status = if self.aged_out {
            ExecutionStatus::TimedOut
        } else if self.cancel_requested {
            ExecutionStatus::Cancelled
        } else if failed_step.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        };

        // Output capture is best-effort even on failure.
        let outputs = self.capture_outputs();
        let error = failed_step.and_then(|s| s.error.map(|f| f.message));

        let now = Utc::now();
        let updated = self.runtime.store.update_execution(self.execution_id, &mut |execution| {
            execution.outputs = outputs.clone();
            execution.error = error.clone();
            execution.finish(status, now)
        });
        let execution = match updated {
            Ok(execution) => execution,
            Err(err) => {
                warn!(execution = %self.execution_id, error = %err, "finalize rejected");
                return;
            }
        };

        let kind = match status {
            ExecutionStatus::Succeeded => EventKind::ExecutionCompleted,
            ExecutionStatus::Failed => EventKind::ExecutionFailed,
            ExecutionStatus::Cancelled => EventKind::ExecutionCancelled,
            _ => EventKind::ExecutionTimedOut,
        };
        self.runtime
            .pipeline
            .emit_lenient(ExecutionEvent::new(
                self.execution_id,
                kind,
                json!({
                    "status": status,
                    "error": execution.error,
                }),
            ))
            .await;
        info!(execution = %self.execution_id, ?status, "execution finished");

        self.sink.execution_finished(&execution).await;
    }

    fn capture_outputs(&self) -> Json {
        if self.definition.outputs.is_empty() {
            return Json::Null;
        }
        let ctx = self.eval_context();
        let mut outputs = serde_json::Map::new();
        for spec in &self.definition.outputs {
            match render_value(&spec.source, &ctx) {
                Ok(value) => {
                    let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
                    if size > self.runtime.config.output_variable_max_bytes {
                        warn!(output = %spec.name, size, "output exceeds size cap; dropping value");
                        outputs.insert(spec.name.clone(), json!({ "truncated": true, "bytes": size }));
                    } else {
                        outputs.insert(spec.name.clone(), value);
                    }
                }
                Err(err) => {
                    warn!(output = %spec.name, error = %err, "output capture failed");
                }
            }
        }
        Json::Object(outputs)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Fresh evaluation context from the persisted execution and steps.
    fn eval_context(&self) -> EvalContext {
        let execution = self.runtime.store.execution(self.execution_id);
        let (input, trigger) = execution
            .map_or((Json::Null, Json::Null), |e| (e.input, e.trigger));
        let mut ctx = EvalContext::new(input, trigger);
        for record in self.runtime.store.steps_for(self.execution_id) {
            ctx.insert_step(
                record.step_id.clone(),
                StepSnapshot::new(
                    record.output.clone(),
                    record.status.as_str(),
                    record.duration_ms,
                    record.started_at,
                    record.completed_at,
                ),
            );
        }
        ctx
    }

    async fn emit_step(&self, kind: EventKind, step_id: &str, data: Json) {
        self.runtime
            .pipeline
            .emit_lenient(ExecutionEvent::for_step(self.execution_id, kind, step_id, data))
            .await;
    }
}

const fn status_name(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Paused => "paused",
        ExecutionStatus::Succeeded => "succeeded",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
        ExecutionStatus::TimedOut => "timed_out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(yaml: &str) -> ProcessDefinition {
        ProcessDefinition::from_yaml(yaml).unwrap()
    }

    #[test]
    fn graph_effective_deps_include_gateway_ownership() {
        let def = definition(
            r#"
name: diamond
version: "1"
steps:
  - id: score
    type: agent_task
    agent: a
    message: m
  - id: route
    type: gateway
    depends_on: [score]
    conditions:
      - expression: "input.score >= 70"
        next: good
      - default: true
        next: bad
  - id: good
    type: timer
    duration_seconds: 1
  - id: bad
    type: timer
    duration_seconds: 1
  - id: join
    type: agent_task
    agent: a
    message: m
    depends_on: [good, bad]
"#,
        );
        let graph = StepGraph::build(&def);
        assert!(graph.effective_deps["good"].contains(&"route".to_string()));
        assert!(graph.effective_deps["bad"].contains(&"route".to_string()));
        assert_eq!(
            graph.gateway_ancestors["join"],
            vec!["route".to_string()]
        );

        let closure = graph.forward_closure("good");
        assert!(closure.contains("good"));
        assert!(closure.contains("join"));
        assert!(!closure.contains("bad"));
    }

    #[test]
    fn graph_order_matches_source_order() {
        let def = definition(
            r#"
name: ordered
version: "1"
steps:
  - id: c
    type: timer
    duration_seconds: 1
  - id: a
    type: timer
    duration_seconds: 1
  - id: b
    type: timer
    duration_seconds: 1
"#,
        );
        let graph = StepGraph::build(&def);
        assert_eq!(graph.order, vec!["c", "a", "b"]);
    }
}
