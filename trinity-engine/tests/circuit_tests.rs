//! Circuit breaker and per-agent queue behavior through the whole engine.

mod common;

use common::{wait_terminal, ScriptedFleet};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use trinity_core::{AgentCallError, AgentClient, EngineConfig, ExecutionStatus, FailureKind, Origin};
use trinity_engine::{Actor, CircuitState, ProcessEngine, Role};

fn admin() -> Actor {
    Actor::new("admin", vec![Role::Admin])
}

const ONE_CALL: &str = r#"
name: one-call
version: "1"
config:
  max_concurrent: 20
steps:
  - id: work
    type: agent_task
    agent: worker
    message: do it
"#;

async fn run_once(engine: &ProcessEngine, name: &str) -> trinity_core::Execution {
    let id = engine
        .start_execution(name, None, json!({}), Origin::manual("admin", None), &admin())
        .await
        .unwrap();
    wait_terminal(&engine.store(), id, Duration::from_secs(5)).await
}

#[tokio::test]
async fn three_consecutive_failures_open_the_circuit() {
    let fleet = Arc::new(ScriptedFleet::new());
    for _ in 0..3 {
        fleet.script("worker", Err(AgentCallError::Transient { message: "500".into() }));
    }
    fleet.respond("worker", "recovered");
    let mut config = EngineConfig::for_testing();
    // Long cooldown: no half-open probe can sneak into this test.
    config.circuit_cooldown = Duration::from_secs(60);
    let engine = ProcessEngine::builder()
        .with_config(config)
        .with_agent_client(Arc::clone(&fleet) as Arc<dyn AgentClient>)
        .build();
    engine.start().await.unwrap();

    let actor = admin();
    let reference = engine.create_definition(ONE_CALL, &actor).unwrap();
    engine
        .publish_definition(&reference.name, &reference.version, &actor)
        .unwrap();

    // Three failing executions trip the breaker.
    for _ in 0..3 {
        let execution = run_once(&engine, &reference.name).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }
    assert_eq!(fleet.calls_to("worker"), 3);

    let circuits = engine.get_circuit_states(&actor).unwrap();
    let worker = circuits.iter().find(|c| c.agent == "worker").unwrap();
    assert_eq!(worker.state, CircuitState::Open);

    // Fourth submission fails fast without reaching the agent.
    let execution = run_once(&engine, &reference.name).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let step = engine.store().step(execution.id, "work").unwrap();
    assert_eq!(step.error.unwrap().kind, FailureKind::CircuitOpen);
    assert_eq!(fleet.calls_to("worker"), 3);

    // Manual reset lets the next call through.
    engine.reset_circuit("worker", &actor).unwrap();
    let execution = run_once(&engine, &reference.name).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(fleet.calls_to("worker"), 4);
}

#[tokio::test]
async fn circuit_open_is_not_burned_down_by_retries() {
    let fleet = Arc::new(ScriptedFleet::new());
    for _ in 0..3 {
        fleet.script("worker", Err(AgentCallError::Transient { message: "500".into() }));
    }
    let engine = ProcessEngine::builder()
        .with_config(EngineConfig::for_testing())
        .with_agent_client(Arc::clone(&fleet) as Arc<dyn AgentClient>)
        .build();
    engine.start().await.unwrap();

    let actor = admin();
    let yaml = r#"
name: retry-against-open
version: "1"
config:
  max_concurrent: 20
steps:
  - id: work
    type: agent_task
    agent: worker
    message: do it
    retry:
      max_attempts: 5
      backoff: fixed
      initial_delay_seconds: 0
"#;
    let reference = engine.create_definition(yaml, &actor).unwrap();
    engine
        .publish_definition(&reference.name, &reference.version, &actor)
        .unwrap();

    // One execution whose retries trip the circuit mid-flight: three
    // transient failures open it, the fourth attempt sees CircuitOpen and
    // fails fast instead of spending the remaining retry budget.
    let execution = run_once(&engine, &reference.name).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let step = engine.store().step(execution.id, "work").unwrap();
    assert_eq!(step.error.unwrap().kind, FailureKind::CircuitOpen);
    assert_eq!(step.attempt, 4);
    assert_eq!(fleet.calls_to("worker"), 3);
}

#[tokio::test]
async fn half_open_probe_closes_after_cooldown() {
    let fleet = Arc::new(ScriptedFleet::new());
    for _ in 0..3 {
        fleet.script("worker", Err(AgentCallError::Transient { message: "500".into() }));
    }
    fleet.respond("worker", "healthy again");
    let mut config = EngineConfig::for_testing();
    config.circuit_cooldown = Duration::from_millis(100);
    let engine = ProcessEngine::builder()
        .with_config(config)
        .with_agent_client(Arc::clone(&fleet) as Arc<dyn AgentClient>)
        .build();
    engine.start().await.unwrap();

    let actor = admin();
    let reference = engine.create_definition(ONE_CALL, &actor).unwrap();
    engine
        .publish_definition(&reference.name, &reference.version, &actor)
        .unwrap();

    for _ in 0..3 {
        run_once(&engine, &reference.name).await;
    }
    let circuits = engine.get_circuit_states(&actor).unwrap();
    assert_eq!(circuits[0].state, CircuitState::Open);

    // After the cooldown the probe goes through and closes the circuit.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let execution = run_once(&engine, &reference.name).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    let circuits = engine.get_circuit_states(&actor).unwrap();
    assert_eq!(circuits[0].state, CircuitState::Closed);
}

#[tokio::test]
async fn queue_overflow_fails_with_agent_busy() {
    let fleet = Arc::new(ScriptedFleet::new().with_delay(Duration::from_millis(400)));
    fleet.respond("worker", "slow and steady");
    let mut config = EngineConfig::for_testing();
    config.agent_queue_max = 1;
    let engine = ProcessEngine::builder()
        .with_config(config)
        .with_agent_client(Arc::clone(&fleet) as Arc<dyn AgentClient>)
        .build();
    engine.start().await.unwrap();

    let actor = admin();
    let reference = engine.create_definition(ONE_CALL, &actor).unwrap();
    engine
        .publish_definition(&reference.name, &reference.version, &actor)
        .unwrap();

    // One running, one queued, the third submission overflows.
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            engine
                .start_execution(&reference.name, None, json!({}), Origin::manual("admin", None), &actor)
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let store = engine.store();
    let mut statuses = Vec::new();
    for id in ids {
        let execution = wait_terminal(&store, id, Duration::from_secs(10)).await;
        let step = store.step(id, "work").unwrap();
        statuses.push((execution.status, step.error.map(|e| e.kind)));
    }

    let busy = statuses
        .iter()
        .filter(|(status, kind)| {
            *status == ExecutionStatus::Failed && *kind == Some(FailureKind::AgentBusy)
        })
        .count();
    let succeeded = statuses
        .iter()
        .filter(|(status, _)| *status == ExecutionStatus::Succeeded)
        .count();
    assert_eq!(succeeded, 2, "statuses: {statuses:?}");
    assert_eq!(busy, 1, "statuses: {statuses:?}");
}
