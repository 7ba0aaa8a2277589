//! Recovery sweep: resuming interrupted executions, firing past-due
//! timers exactly once, and aging out stale executions.

mod common;

use common::{wait_terminal, ScriptedFleet};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use trinity_core::{
    AgentClient, AwaitKind, DefinitionStatus, EngineConfig, EventKind, Execution, ExecutionStatus,
    Origin, ProcessDefinition, StepExecution, StepStatus,
};
use trinity_engine::{Actor, MemoryStateStore, ProcessEngine, Role, StateStore};

fn admin() -> Actor {
    Actor::new("admin", vec![Role::Admin])
}

const RECOVER_FLOW: &str = r#"
name: recover-flow
version: "1"
steps:
  - id: analyze
    type: agent_task
    agent: analyst
    message: "analyze {{input.subject}}"
  - id: wait-12h
    type: timer
    duration_seconds: 43200
  - id: publish
    type: agent_task
    agent: analyst
    message: "publish {{steps.analyze.output}}"
    depends_on: [analyze, wait-12h]
"#;

/// Seed the store as a crashed engine would have left it: the execution
/// running, one step mid-flight, one timer awaiting with a past fire-at.
fn seed_crashed_state(store: &Arc<dyn StateStore>) -> Execution {
    let mut definition = ProcessDefinition::from_yaml(RECOVER_FLOW).unwrap();
    definition.status = DefinitionStatus::Published;
    store.put_definition(definition).unwrap();

    let mut execution = Execution::new(
        trinity_core::DefinitionRef::new("recover-flow", "1"),
        Origin::manual("admin", None),
        json!({"subject": "quarterly numbers"}),
        json!({"kind": "manual"}),
    );
    execution.status = ExecutionStatus::Running;
    execution.started_at = Utc::now() - chrono::Duration::hours(1);
    store.insert_execution(execution.clone()).unwrap();

    let mut analyze = StepExecution::new(execution.id, "analyze");
    analyze.status = StepStatus::Running;
    analyze.started_at = Some(Utc::now() - chrono::Duration::minutes(30));
    store.upsert_step(analyze).unwrap();

    let mut timer = StepExecution::new(execution.id, "wait-12h");
    timer.status = StepStatus::Awaiting;
    timer.awaiting = Some(AwaitKind::Timer);
    timer.wake_at = Some(Utc::now() - chrono::Duration::minutes(5));
    store.upsert_step(timer).unwrap();

    execution
}

#[tokio::test]
async fn restart_resumes_running_and_fires_due_timer_once() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let seeded = seed_crashed_state(&store);

    let fleet = Arc::new(ScriptedFleet::new());
    fleet.respond("analyst", "report ready");
    let engine = ProcessEngine::builder()
        .with_config(EngineConfig::for_testing())
        .with_store(Arc::clone(&store))
        .with_agent_client(Arc::clone(&fleet) as Arc<dyn AgentClient>)
        .build();

    let report = engine.start().await.unwrap();
    assert_eq!(report.executions_scanned, 1);
    assert_eq!(report.executions_resumed, 1);
    assert_eq!(report.steps_reset, 1);
    assert_eq!(report.executions_timed_out, 0);

    let execution = wait_terminal(&store, seeded.id, Duration::from_secs(5)).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    let steps = store.steps_for(seeded.id);
    let step_of = |id: &str| steps.iter().find(|s| s.step_id == id).unwrap().clone();
    assert_eq!(step_of("analyze").status, StepStatus::Succeeded);
    assert_eq!(step_of("publish").status, StepStatus::Succeeded);

    // The timer fired exactly once, at its persisted instant.
    let timer = step_of("wait-12h");
    assert_eq!(timer.status, StepStatus::Succeeded);
    assert!(timer.output["fired_at"].is_string());
    let fired_events = store
        .events_for(seeded.id)
        .into_iter()
        .filter(|e| {
            e.kind == EventKind::StepCompleted && e.data["step_id"] == json!("wait-12h")
        })
        .count();
    assert_eq!(fired_events, 1);
}

#[tokio::test]
async fn stale_executions_age_out_as_timed_out() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let mut seeded = seed_crashed_state(&store);
    // Push the start time past the age limit.
    seeded.started_at = Utc::now() - chrono::Duration::days(2);
    let stale_start = seeded.started_at;
    store
        .update_execution(seeded.id, &mut |execution| {
            execution.started_at = stale_start;
            Ok(())
        })
        .unwrap();

    let engine = ProcessEngine::builder()
        .with_config(EngineConfig::for_testing())
        .with_store(Arc::clone(&store))
        .build();
    let report = engine.start().await.unwrap();
    assert_eq!(report.executions_timed_out, 1);
    assert_eq!(report.executions_resumed, 0);

    let execution = store.execution(seeded.id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    // In-flight steps were sealed, not left dangling.
    assert!(store
        .steps_for(seeded.id)
        .iter()
        .all(|s| s.status.is_terminal()));
}

#[tokio::test]
async fn recovery_sweep_is_idempotent() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let seeded = seed_crashed_state(&store);
    let stale_start = Utc::now() - chrono::Duration::days(2);
    store
        .update_execution(seeded.id, &mut |execution| {
            execution.started_at = stale_start;
            Ok(())
        })
        .unwrap();

    let first = ProcessEngine::builder()
        .with_config(EngineConfig::for_testing())
        .with_store(Arc::clone(&store))
        .build();
    let report = first.start().await.unwrap();
    assert_eq!(report.executions_timed_out, 1);
    first.shutdown_triggers();

    // A second sweep over the same state finds nothing left to repair.
    let second = ProcessEngine::builder()
        .with_config(EngineConfig::for_testing())
        .with_store(Arc::clone(&store))
        .build();
    let report = second.start().await.unwrap();
    assert_eq!(report.executions_scanned, 0);
    assert_eq!(report.executions_timed_out, 0);
    assert_eq!(report.steps_reset, 0);

    let execution = store.execution(seeded.id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::TimedOut);
}

#[tokio::test]
async fn recovery_report_is_queryable() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    seed_crashed_state(&store);

    let fleet = Arc::new(ScriptedFleet::new());
    fleet.respond("analyst", "done");
    let engine = ProcessEngine::builder()
        .with_config(EngineConfig::for_testing())
        .with_store(store)
        .with_agent_client(fleet as Arc<dyn AgentClient>)
        .build();
    engine.start().await.unwrap();

    let report = engine.get_recovery_status(&admin()).unwrap().unwrap();
    assert_eq!(report.executions_scanned, 1);

    let viewer = Actor::new("viewer", vec![Role::Viewer]);
    assert!(engine.get_recovery_status(&viewer).is_err());
}
