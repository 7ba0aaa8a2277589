//! ABOUTME: Projection store and append-only event streams
//! ABOUTME: In-memory backend first; the trait keeps the seam for KV-backed deployments

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use trinity_core::{
    ApprovalTask, DefinitionStatus, EngineError, Execution, ExecutionEvent, ExecutionId,
    ExecutionStatus, ProcessDefinition, Result, StepExecution,
};
use uuid::Uuid;

/// Filter for execution listings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub definition_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
}

/// Persistence seam for the four projection tables plus the per-execution
/// event stream. Every state transition is written here before any
/// dependent step observes it.
pub trait StateStore: Send + Sync {
    // Definitions
    fn put_definition(&self, definition: ProcessDefinition) -> Result<()>;
    fn definition(&self, name: &str, version: &str) -> Option<Arc<ProcessDefinition>>;
    /// Latest published version when `version` is `None`.
    fn published_definition(&self, name: &str, version: Option<&str>)
        -> Option<Arc<ProcessDefinition>>;
    fn definitions(&self) -> Vec<Arc<ProcessDefinition>>;

    // Executions
    fn insert_execution(&self, execution: Execution) -> Result<()>;
    fn execution(&self, id: ExecutionId) -> Option<Execution>;
    fn update_execution(
        &self,
        id: ExecutionId,
        update: &mut dyn FnMut(&mut Execution) -> Result<()>,
    ) -> Result<Execution>;
    fn executions(&self, filter: &ExecutionFilter) -> Vec<Execution>;
    fn non_terminal_executions(&self) -> Vec<Execution>;

    // Step executions
    fn upsert_step(&self, step: StepExecution) -> Result<()>;
    fn step(&self, execution_id: ExecutionId, step_id: &str) -> Option<StepExecution>;
    fn steps_for(&self, execution_id: ExecutionId) -> Vec<StepExecution>;

    // Approval tasks
    fn insert_approval(&self, task: ApprovalTask) -> Result<()>;
    fn approval(&self, id: Uuid) -> Option<ApprovalTask>;
    fn update_approval(
        &self,
        id: Uuid,
        update: &mut dyn FnMut(&mut ApprovalTask) -> Result<()>,
    ) -> Result<ApprovalTask>;
    fn approvals_for(&self, execution_id: ExecutionId) -> Vec<ApprovalTask>;

    // Event stream
    fn append_event(&self, event: ExecutionEvent);
    fn events_for(&self, execution_id: ExecutionId) -> Vec<ExecutionEvent>;
}

/// In-memory projection store. Writer-serialized per table; suitable for a
/// single engine process and for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    definitions: RwLock<Vec<Arc<ProcessDefinition>>>,
    executions: RwLock<HashMap<ExecutionId, Execution>>,
    steps: RwLock<HashMap<ExecutionId, Vec<StepExecution>>>,
    approvals: RwLock<HashMap<Uuid, ApprovalTask>>,
    events: RwLock<HashMap<ExecutionId, Vec<ExecutionEvent>>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn put_definition(&self, definition: ProcessDefinition) -> Result<()> {
        let mut definitions = self.definitions.write();
        if let Some(existing) = definitions
            .iter_mut()
            .find(|d| d.name == definition.name && d.version == definition.version)
        {
            if existing.is_published() && definition.status == DefinitionStatus::Published {
                return Err(EngineError::Conflict {
                    message: format!("definition {} is published and immutable", existing.definition_ref()),
                });
            }
            *existing = Arc::new(definition);
        } else {
            definitions.push(Arc::new(definition));
        }
        Ok(())
    }

    fn definition(&self, name: &str, version: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .iter()
            .find(|d| d.name == name && d.version == version)
            .cloned()
    }

    fn published_definition(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Option<Arc<ProcessDefinition>> {
        let definitions = self.definitions.read();
        match version {
            Some(version) => definitions
                .iter()
                .find(|d| d.name == name && d.version == version && d.is_published())
                .cloned(),
            None => definitions
                .iter()
                .filter(|d| d.name == name && d.is_published())
                .last()
                .cloned(),
        }
    }

    fn definitions(&self) -> Vec<Arc<ProcessDefinition>> {
        self.definitions.read().clone()
    }

    fn insert_execution(&self, execution: Execution) -> Result<()> {
        let mut executions = self.executions.write();
        if executions.contains_key(&execution.id) {
            return Err(EngineError::Conflict {
                message: format!("execution {} already exists", execution.id),
            });
        }
        executions.insert(execution.id, execution);
        Ok(())
    }

    fn execution(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.read().get(&id).cloned()
    }

    fn update_execution(
        &self,
        id: ExecutionId,
        update: &mut dyn FnMut(&mut Execution) -> Result<()>,
    ) -> Result<Execution> {
        let mut executions = self.executions.write();
        let execution = executions.get_mut(&id).ok_or_else(|| EngineError::NotFound {
            message: format!("execution {id}"),
        })?;
        update(execution)?;
        Ok(execution.clone())
    }

    fn executions(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        let mut out: Vec<Execution> = self
            .executions
            .read()
            .values()
            .filter(|e| {
                filter
                    .definition_name
                    .as_ref()
                    .is_none_or(|name| &e.definition.name == name)
                    && filter.status.is_none_or(|status| e.status == status)
            })
            .cloned()
            .collect();
        // ULIDs sort by creation time; newest first for listings.
        out.sort_by(|a, b| b.id.cmp(&a.id));
        let out = out.into_iter().skip(filter.offset);
        if filter.limit == 0 {
            out.collect()
        } else {
            out.take(filter.limit).collect()
        }
    }

    fn non_terminal_executions(&self) -> Vec<Execution> {
        self.executions
            .read()
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect()
    }

    fn upsert_step(&self, step: StepExecution) -> Result<()> {
        let mut steps = self.steps.write();
        let list = steps.entry(step.execution_id).or_default();
        if let Some(existing) = list.iter_mut().find(|s| s.step_id == step.step_id) {
            *existing = step;
        } else {
            list.push(step);
        }
        Ok(())
    }

    fn step(&self, execution_id: ExecutionId, step_id: &str) -> Option<StepExecution> {
        self.steps
            .read()
            .get(&execution_id)
            .and_then(|list| list.iter().find(|s| s.step_id == step_id).cloned())
    }

    fn steps_for(&self, execution_id: ExecutionId) -> Vec<StepExecution> {
        self.steps
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default()
    }

    fn insert_approval(&self, task: ApprovalTask) -> Result<()> {
        self.approvals.write().insert(task.id, task);
        Ok(())
    }

    fn approval(&self, id: Uuid) -> Option<ApprovalTask> {
        self.approvals.read().get(&id).cloned()
    }

    fn update_approval(
        &self,
        id: Uuid,
        update: &mut dyn FnMut(&mut ApprovalTask) -> Result<()>,
    ) -> Result<ApprovalTask> {
        let mut approvals = self.approvals.write();
        let task = approvals.get_mut(&id).ok_or_else(|| EngineError::NotFound {
            message: format!("approval {id}"),
        })?;
        update(task)?;
        Ok(task.clone())
    }

    fn approvals_for(&self, execution_id: ExecutionId) -> Vec<ApprovalTask> {
        self.approvals
            .read()
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect()
    }

    fn append_event(&self, event: ExecutionEvent) {
        self.events
            .write()
            .entry(event.execution_id)
            .or_default()
            .push(event);
    }

    fn events_for(&self, execution_id: ExecutionId) -> Vec<ExecutionEvent> {
        self.events
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default()
    }
}
