//! ABOUTME: ProcessEngine facade: definition lifecycle, triggers, queries, control
//! ABOUTME: Wires store, bus, audit, agent gateway, scheduler, limits, and recovery

use crate::agents::AgentGateway;
use crate::approvals::ApprovalService;
use crate::auth::{Actor, Permission};
use crate::circuit::{CircuitRegistry, CircuitSnapshot};
use crate::handlers::{StepRuntime, SubProcessLauncher};
use crate::lane::AgentLanes;
use crate::limits::ConcurrencyLimits;
use crate::null::{NullAgentClient, NullApprovalNotifier, NullAuditSink, NullNotifier};
use crate::pipeline::EventPipeline;
use crate::recovery::{sweep, RecoveryReport};
use crate::scheduler::{CompletionSink, ExecutionScheduler, SchedulerHandle, SchedulerMsg};
use crate::store::{ExecutionFilter, MemoryStateStore, StateStore};
use crate::triggers::{
    webhook_trigger_context, CronRunner, LocalScheduleGuard, ScheduleGuard, ScheduleTarget,
    WebhookRateLimiter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trinity_core::{
    validate_definition, AgentClient, ApprovalDecision, ApprovalNotifier, ApprovalTask, AuditSink,
    AwaitKind, DefinitionLookup, DefinitionRef, DefinitionStatus, EngineConfig, EngineError,
    EventKind, Execution, ExecutionEvent, ExecutionId, Notifier, Origin, ProcessDefinition,
    ProcessRef, Result, StepExecution, StepStatus, TriggerKind, TriggerSpec,
};
use trinity_events::{AuditLog, EventBus};
use uuid::Uuid;

/// Builder for [`ProcessEngine`]. Collaborators default to no-ops so tests
/// and minimal deployments only wire what they use.
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    agent_client: Arc<dyn AgentClient>,
    notifier: Arc<dyn Notifier>,
    approval_notifier: Arc<dyn ApprovalNotifier>,
    audit_sink: Arc<dyn AuditSink>,
    schedule_guard: Arc<dyn ScheduleGuard>,
}

impl ProcessEngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: Arc::new(MemoryStateStore::new()),
            agent_client: Arc::new(NullAgentClient),
            notifier: Arc::new(NullNotifier),
            approval_notifier: Arc::new(NullApprovalNotifier),
            audit_sink: Arc::new(NullAuditSink),
            schedule_guard: Arc::new(LocalScheduleGuard::default()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_agent_client(mut self, client: Arc<dyn AgentClient>) -> Self {
        self.agent_client = client;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_approval_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.approval_notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    #[must_use]
    pub fn with_schedule_guard(mut self, guard: Arc<dyn ScheduleGuard>) -> Self {
        self.schedule_guard = guard;
        self
    }

    #[must_use]
    pub fn build(self) -> ProcessEngine {
        let config = Arc::new(self.config);
        let store = self.store;
        let bus = Arc::new(EventBus::new());
        let audit = AuditLog::new(self.audit_sink, config.audit_fallback_path.clone());
        let pipeline = Arc::new(EventPipeline::new(Arc::clone(&store), Arc::clone(&bus), audit));
        let circuits = Arc::new(CircuitRegistry::new(
            config.circuit_failure_threshold,
            config.circuit_cooldown,
        ));
        let gateway = Arc::new(AgentGateway::new(
            AgentLanes::new(config.agent_queue_max),
            circuits,
            self.agent_client,
            Arc::clone(&bus),
            config.agent_lease_slack,
        ));
        let approvals = Arc::new(ApprovalService::new(
            Arc::clone(&store),
            self.approval_notifier,
            Arc::clone(&pipeline),
        ));

        let webhook_limiter = WebhookRateLimiter::new(config.webhook_rate_per_minute);
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let launcher: Arc<dyn SubProcessLauncher> = Arc::new(ChildLauncher {
                engine: weak.clone(),
            });
            let runtime = Arc::new(StepRuntime {
                config: Arc::clone(&config),
                store: Arc::clone(&store),
                gateway: Arc::clone(&gateway),
                notifier: self.notifier,
                approvals: Arc::clone(&approvals),
                sub_processes: launcher,
                pipeline: Arc::clone(&pipeline),
            });
            EngineInner {
                config: Arc::clone(&config),
                store,
                bus,
                pipeline,
                runtime,
                approvals,
                gateway,
                limits: ConcurrencyLimits::new(
                    config.max_global_executions,
                    config.max_per_process_executions,
                ),
                schedulers: DashMap::new(),
                webhook_routes: DashMap::new(),
                webhook_limiter,
                recovery: Mutex::new(None),
                schedule_guard: self.schedule_guard,
            }
        });
        inner.rebuild_webhook_routes();
        ProcessEngine {
            inner,
            cron_shutdown: CancellationToken::new(),
        }
    }
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct EngineInner {
    config: Arc<EngineConfig>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    pipeline: Arc<EventPipeline>,
    runtime: Arc<StepRuntime>,
    approvals: Arc<ApprovalService>,
    gateway: Arc<AgentGateway>,
    limits: ConcurrencyLimits,
    schedulers: DashMap<ExecutionId, SchedulerHandle>,
    /// Global webhook route table: trigger id -> published definition.
    webhook_routes: DashMap<String, DefinitionRef>,
    webhook_limiter: WebhookRateLimiter,
    recovery: Mutex<Option<RecoveryReport>>,
    schedule_guard: Arc<dyn ScheduleGuard>,
}

/// The orchestration platform's process engine. One instance drives many
/// concurrent executions against the agent fleet.
pub struct ProcessEngine {
    inner: Arc<EngineInner>,
    cron_shutdown: CancellationToken,
}

impl ProcessEngine {
    #[must_use]
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    /// Run the recovery sweep and start the cron evaluator. Call once
    /// after construction.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.inner.recover().await;
        let target: Arc<dyn ScheduleTarget> = Arc::new(ScheduleBridge {
            engine: Arc::downgrade(&self.inner),
        });
        CronRunner::new(target, Arc::clone(&self.inner.schedule_guard))
            .spawn(self.cron_shutdown.clone());
        Ok(report)
    }

    /// Stop background trigger evaluation (in-flight executions continue).
    pub fn shutdown_triggers(&self) {
        self.cron_shutdown.cancel();
    }

    // ------------------------------------------------------------------
    // Definition lifecycle
    // ------------------------------------------------------------------

    /// Parse and validate a YAML definition, storing it as a draft.
    pub fn create_definition(&self, yaml: &str, actor: &Actor) -> Result<DefinitionRef> {
        actor.require(Permission::CreateDefinition)?;
        let mut definition = ProcessDefinition::from_yaml(yaml)?;
        definition.status = DefinitionStatus::Draft;
        let lookup = StoreLookup(Arc::clone(&self.inner.store));
        validate_definition(&definition, &lookup)?;
        let reference = definition.definition_ref();
        self.inner.store.put_definition(definition)?;
        info!(definition = %reference, "definition created as draft");
        Ok(reference)
    }

    /// Publish a draft. Published definitions are immutable and become
    /// addressable by triggers and sub-processes.
    pub fn publish_definition(&self, name: &str, version: &str, actor: &Actor) -> Result<()> {
        actor.require(Permission::PublishDefinition)?;
        let Some(definition) = self.inner.store.definition(name, version) else {
            return Err(EngineError::NotFound {
                message: format!("definition {name}@{version}"),
            });
        };
        if definition.is_published() {
            return Err(EngineError::Conflict {
                message: format!("definition {name}@{version} is already published"),
            });
        }
        let lookup = StoreLookup(Arc::clone(&self.inner.store));
        validate_definition(&definition, &lookup)?;

        // Webhook trigger ids are a global namespace across published
        // definitions.
        for trigger in &definition.triggers {
            if trigger.kind == TriggerKind::Webhook {
                if let Some(existing) = self.inner.webhook_routes.get(&trigger.id) {
                    if existing.name != name {
                        return Err(EngineError::Conflict {
                            message: format!(
                                "webhook trigger '{}' is already registered by {}",
                                trigger.id, *existing
                            ),
                        });
                    }
                }
            }
        }

        let mut published = (*definition).clone();
        published.status = DefinitionStatus::Published;
        self.inner.store.put_definition(published.clone())?;
        for trigger in &published.triggers {
            if trigger.kind == TriggerKind::Webhook {
                self.inner
                    .webhook_routes
                    .insert(trigger.id.clone(), published.definition_ref());
            }
        }
        info!(definition = %published.definition_ref(), "definition published");
        Ok(())
    }

    /// Archive a published definition; running executions finish, new
    /// triggers stop resolving to it.
    pub fn archive_definition(&self, name: &str, version: &str, actor: &Actor) -> Result<()> {
        actor.require(Permission::PublishDefinition)?;
        let Some(definition) = self.inner.store.definition(name, version) else {
            return Err(EngineError::NotFound {
                message: format!("definition {name}@{version}"),
            });
        };
        let mut archived = (*definition).clone();
        archived.status = DefinitionStatus::Archived;
        self.inner.store.put_definition(archived)?;
        for trigger in &definition.triggers {
            if trigger.kind == TriggerKind::Webhook {
                self.inner.webhook_routes.remove(&trigger.id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trigger surface
    // ------------------------------------------------------------------

    /// Start an execution of a published definition.
    pub async fn start_execution(
        &self,
        name: &str,
        version: Option<&str>,
        input: Json,
        origin: Origin,
        actor: &Actor,
    ) -> Result<ExecutionId> {
        actor.require(Permission::StartExecution)?;
        let definition = self
            .inner
            .store
            .published_definition(name, version)
            .ok_or_else(|| EngineError::NotFound {
                message: format!("no published definition '{name}'"),
            })?;
        let trigger = json!({
            "kind": "manual",
            "actor": actor.id,
        });
        self.inner
            .begin_execution(definition, origin, input, trigger, None)
            .await
    }

    /// Fire a webhook trigger. Rate-limited per trigger id.
    pub async fn fire_webhook(
        &self,
        trigger_id: &str,
        body: Json,
        source_ip: &str,
    ) -> Result<ExecutionId> {
        self.inner.webhook_limiter.check(trigger_id)?;
        let reference = self
            .inner
            .webhook_routes
            .get(trigger_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::NotFound {
                message: format!("webhook trigger '{trigger_id}'"),
            })?;
        let definition = self
            .inner
            .store
            .published_definition(&reference.name, Some(&reference.version))
            .ok_or_else(|| EngineError::NotFound {
                message: format!("definition {reference}"),
            })?;

        // Static trigger input is the base; the webhook body overlays it.
        let static_input = definition
            .trigger(trigger_id)
            .and_then(|t| t.input.clone())
            .unwrap_or(Json::Null);
        let input = merge_inputs(static_input, body.clone());
        let trigger = webhook_trigger_context(trigger_id, &body, source_ip);
        self.inner
            .begin_execution(definition, Origin::webhook(), input, trigger, None)
            .await
    }

    // ------------------------------------------------------------------
    // Queries and control
    // ------------------------------------------------------------------

    pub fn get_execution(
        &self,
        id: ExecutionId,
        actor: &Actor,
    ) -> Result<(Execution, Vec<StepExecution>)> {
        actor.require(Permission::ViewExecutions)?;
        let execution = self.inner.store.execution(id).ok_or_else(|| EngineError::NotFound {
            message: format!("execution {id}"),
        })?;
        let steps = self.inner.store.steps_for(id);
        Ok((execution, steps))
    }

    pub fn list_executions(&self, filter: &ExecutionFilter, actor: &Actor) -> Result<Vec<Execution>> {
        actor.require(Permission::ViewExecutions)?;
        Ok(self.inner.store.executions(filter))
    }

    /// Record an approval decision and resume the owning step.
    pub async fn decide_approval(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        comments: Option<String>,
        actor: &Actor,
    ) -> Result<ApprovalTask> {
        let task = self
            .inner
            .approvals
            .decide(approval_id, decision, comments, actor)
            .await?;
        if let Some(handle) = self.inner.schedulers.get(&task.execution_id) {
            let _ = handle.tx.send(SchedulerMsg::ApprovalDecided {
                step_id: task.step_id.clone(),
            });
        }
        Ok(task)
    }

    /// Cancel a running execution. Awaiting steps stop immediately;
    /// running steps get the grace period.
    pub fn cancel_execution(&self, id: ExecutionId, actor: &Actor) -> Result<()> {
        actor.require(Permission::CancelExecution)?;
        let execution = self.inner.store.execution(id).ok_or_else(|| EngineError::NotFound {
            message: format!("execution {id}"),
        })?;
        if execution.status.is_terminal() {
            return Err(EngineError::Conflict {
                message: format!("execution {id} is already {:?}", execution.status),
            });
        }
        let Some(handle) = self.inner.schedulers.get(&id) else {
            return Err(EngineError::Conflict {
                message: format!("execution {id} has no live scheduler; run recovery"),
            });
        };
        let _ = handle.tx.send(SchedulerMsg::Cancel);
        Ok(())
    }

    pub fn get_recovery_status(&self, actor: &Actor) -> Result<Option<RecoveryReport>> {
        actor.require(Permission::ViewRecovery)?;
        Ok(self.inner.recovery.lock().clone())
    }

    pub fn get_circuit_states(&self, actor: &Actor) -> Result<Vec<CircuitSnapshot>> {
        actor.require(Permission::ViewExecutions)?;
        Ok(self.inner.gateway.circuits().snapshots())
    }

    /// Manually close an agent's circuit.
    pub fn reset_circuit(&self, agent: &str, actor: &Actor) -> Result<()> {
        actor.require(Permission::ResetCircuit)?;
        self.inner.gateway.circuits().reset(agent);
        Ok(())
    }

    /// Subscribe to engine events by pattern (`execution.*`, `step.failed`).
    pub fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<
        tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>,
        trinity_events::SubscribeError,
    > {
        self.inner.bus.subscribe(pattern)
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.inner.store)
    }

    #[must_use]
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }
}

impl EngineInner {
    /// Create, persist, and schedule one execution. The critical
    /// execution-started audit write gates the whole operation.
    async fn begin_execution(
        self: &Arc<Self>,
        definition: Arc<ProcessDefinition>,
        origin: Origin,
        input: Json,
        trigger: Json,
        parent: Option<(ExecutionId, u32)>,
    ) -> Result<ExecutionId> {
        if parent.is_none() {
            let cap_override = definition.config.as_ref().and_then(|c| c.max_concurrent);
            self.limits.admit(&definition.name, cap_override)?;
        } else {
            // Children occupy a counted slot without being cap-refused;
            // refusing mid-workflow would deadlock parents against children.
            self.limits.register(&definition.name);
        }

        let mut execution = Execution::new(definition.definition_ref(), origin, input, trigger);
        execution.status = trinity_core::ExecutionStatus::Running;
        if let Some((parent_id, depth)) = parent {
            execution = execution.as_child_of(parent_id, depth);
        }

        let started = self
            .pipeline
            .emit(ExecutionEvent::new(
                execution.id,
                EventKind::ExecutionStarted,
                json!({
                    "definition": execution.definition.to_string(),
                    "origin": execution.origin,
                    "parent_execution_id": execution.parent_execution_id.map(|id| id.to_string()),
                }),
            ))
            .await;
        if let Err(err) = started {
            self.limits.release(&definition.name);
            return Err(err);
        }

        self.store.insert_execution(execution.clone())?;
        self.spawn_scheduler(&definition, &execution);
        Ok(execution.id)
    }

    fn spawn_scheduler(self: &Arc<Self>, definition: &Arc<ProcessDefinition>, execution: &Execution) {
        let sink: Arc<dyn CompletionSink> = Arc::new(EngineSink {
            engine: Arc::downgrade(self),
        });
        let handle =
            ExecutionScheduler::spawn(Arc::clone(&self.runtime), sink, Arc::clone(definition), execution);
        self.schedulers.insert(execution.id, handle);
    }

    /// Recovery: classify non-terminal executions and give survivors a
    /// scheduler again.
    async fn recover(self: &Arc<Self>) -> RecoveryReport {
        let (report, resumable) = sweep(&self.store, &self.pipeline, &self.config).await;
        for execution in resumable {
            let Some(definition) = self
                .store
                .definition(&execution.definition.name, &execution.definition.version)
            else {
                warn!(
                    execution = %execution.id,
                    definition = %execution.definition,
                    "cannot resume; definition missing"
                );
                continue;
            };
            if self.schedulers.contains_key(&execution.id) {
                continue;
            }
            self.limits.register(&execution.definition.name);
            self.spawn_scheduler(&definition, &execution);
        }
        self.rebuild_webhook_routes();
        *self.recovery.lock() = Some(report.clone());
        report
    }

    fn rebuild_webhook_routes(&self) {
        for definition in self.store.definitions() {
            if !definition.is_published() {
                continue;
            }
            for trigger in &definition.triggers {
                if trigger.kind == TriggerKind::Webhook {
                    self.webhook_routes
                        .insert(trigger.id.clone(), definition.definition_ref());
                }
            }
        }
    }
}

/// Deep-ish merge for webhook inputs: object keys of `overlay` win over
/// `base`; anything else replaces wholesale.
fn merge_inputs(base: Json, overlay: Json) -> Json {
    match (base, overlay) {
        (Json::Object(mut base), Json::Object(overlay)) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
            Json::Object(base)
        }
        (base, Json::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Completion fan-in: release limits, drop the scheduler handle, and wake
/// a waiting parent.
struct EngineSink {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl CompletionSink for EngineSink {
    async fn execution_finished(&self, execution: &Execution) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.schedulers.remove(&execution.id);
        engine.limits.release(&execution.definition.name);

        if let Some(parent_id) = execution.parent_execution_id {
            let waiting_step = engine
                .store
                .steps_for(parent_id)
                .into_iter()
                .find(|step| {
                    step.status == StepStatus::Awaiting
                        && matches!(
                            &step.awaiting,
                            Some(AwaitKind::SubProcess { child_id }) if *child_id == execution.id
                        )
                })
                .map(|step| step.step_id);
            if let (Some(step_id), Some(handle)) =
                (waiting_step, engine.schedulers.get(&parent_id))
            {
                let _ = handle.tx.send(SchedulerMsg::SubProcessFinished {
                    step_id,
                    child_id: execution.id,
                });
            }
        }
    }
}

/// Sub-process launches re-enter the engine through this seam.
struct ChildLauncher {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl SubProcessLauncher for ChildLauncher {
    async fn launch(
        &self,
        parent: &Execution,
        process: &ProcessRef,
        input: Json,
    ) -> Result<ExecutionId> {
        let engine = self.engine.upgrade().ok_or_else(|| EngineError::Internal {
            message: "engine is shutting down".to_string(),
        })?;
        let definition = engine
            .store
            .published_definition(&process.name, process.version.as_deref())
            .ok_or_else(|| EngineError::NotFound {
                message: format!("no published definition '{}'", process.name),
            })?;
        let trigger = json!({
            "kind": "sub_process",
            "parent_execution_id": parent.id.to_string(),
        });
        engine
            .begin_execution(
                definition,
                parent.origin.clone(),
                input,
                trigger,
                Some((parent.id, parent.depth + 1)),
            )
            .await
    }
}

/// Cron evaluation reaches the engine through this seam.
struct ScheduleBridge {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl ScheduleTarget for ScheduleBridge {
    fn schedule_triggers(&self) -> Vec<(DefinitionRef, TriggerSpec)> {
        let Some(engine) = self.engine.upgrade() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for definition in engine.store.definitions() {
            if !definition.is_published() {
                continue;
            }
            for trigger in &definition.triggers {
                if trigger.kind == TriggerKind::Schedule {
                    out.push((definition.definition_ref(), trigger.clone()));
                }
            }
        }
        out
    }

    async fn fire_schedule(
        &self,
        definition: DefinitionRef,
        trigger: &TriggerSpec,
        occurrence: DateTime<Utc>,
    ) -> Result<ExecutionId> {
        let engine = self.engine.upgrade().ok_or_else(|| EngineError::Internal {
            message: "engine is shutting down".to_string(),
        })?;
        let resolved = engine
            .store
            .published_definition(&definition.name, Some(&definition.version))
            .ok_or_else(|| EngineError::NotFound {
                message: format!("definition {definition}"),
            })?;
        let input = trigger.input.clone().unwrap_or_else(|| json!({}));
        let trigger_ctx = json!({
            "id": trigger.id,
            "kind": "schedule",
            "occurrence": occurrence.to_rfc3339(),
        });
        engine
            .begin_execution(resolved, Origin::schedule(), input, trigger_ctx, None)
            .await
    }
}

/// Published-definition lookup over the state store, for validation.
struct StoreLookup(Arc<dyn StateStore>);

impl DefinitionLookup for StoreLookup {
    fn published(&self, name: &str, version: Option<&str>) -> Option<Arc<ProcessDefinition>> {
        self.0.published_definition(name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_inputs_overlays_objects() {
        let merged = merge_inputs(json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(merge_inputs(json!({"a": 1}), Json::Null), json!({"a": 1}));
        assert_eq!(merge_inputs(Json::Null, json!([1])), json!([1]));
    }
}
