//! ABOUTME: Agent gateway composing the lane, the circuit, and the HTTP client
//! ABOUTME: Stamps idempotency keys and origin headers on every call

use crate::circuit::CircuitRegistry;
use crate::lane::AgentLanes;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use trinity_core::{
    AgentCallError, AgentClient, AgentRequest, AgentResponse, EngineError, EventKind, Execution,
    ExecutionEvent, Result,
};
use trinity_events::EventBus;

/// Resolved inputs for one agent call, produced by the agent_task handler
/// after template interpolation.
#[derive(Debug, Clone)]
pub struct ResolvedAgentCall {
    pub agent: String,
    pub message: String,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub roles: Vec<String>,
    pub timeout: Duration,
}

/// Front door for every agent call the engine makes. Serializes per agent,
/// honors the circuit, and classifies failures for the retry policy.
pub struct AgentGateway {
    lanes: AgentLanes,
    circuits: Arc<CircuitRegistry>,
    client: Arc<dyn AgentClient>,
    bus: Arc<EventBus>,
    lease_slack: Duration,
}

impl AgentGateway {
    #[must_use]
    pub fn new(
        lanes: AgentLanes,
        circuits: Arc<CircuitRegistry>,
        client: Arc<dyn AgentClient>,
        bus: Arc<EventBus>,
        lease_slack: Duration,
    ) -> Self {
        Self {
            lanes,
            circuits,
            client,
            bus,
            lease_slack,
        }
    }

    #[must_use]
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// The idempotency key agents use to deduplicate at-least-once calls.
    #[must_use]
    pub fn idempotency_key(execution: &Execution, step_id: &str, attempt: u32) -> String {
        format!("{}:{}:{}", execution.id, step_id, attempt)
    }

    /// Submit one call. The circuit is consulted before joining the
    /// queue, so an open circuit fails fast without occupying a slot.
    pub async fn call(
        &self,
        execution: &Execution,
        step_id: &str,
        attempt: u32,
        resolved: &ResolvedAgentCall,
    ) -> Result<AgentResponse> {
        let agent = resolved.agent.as_str();
        self.circuits.admit(agent)?;

        let lease_budget = resolved.timeout + self.lease_slack;
        let deadline = Utc::now()
            + chrono::Duration::from_std(lease_budget)
                .unwrap_or_else(|_| chrono::Duration::seconds(330));
        let guard = self
            .lanes
            .acquire(agent, execution.id, step_id, deadline)
            .await?;
        debug!(agent, step_id, attempt, "agent lease acquired");

        let request = AgentRequest {
            agent: agent.to_string(),
            message: resolved.message.clone(),
            model: resolved.model.clone(),
            allowed_tools: resolved.allowed_tools.clone(),
            roles: resolved.roles.clone(),
            timeout: resolved.timeout,
            idempotency_key: Self::idempotency_key(execution, step_id, attempt),
            origin_headers: execution.origin.headers(),
        };

        let outcome = tokio::time::timeout(lease_budget, self.client.call_task(request)).await;
        drop(guard);

        match outcome {
            Ok(Ok(response)) => {
                self.record_circuit(execution, agent, true);
                Ok(response)
            }
            Ok(Err(AgentCallError::Busy)) => Err(EngineError::AgentBusy {
                agent: agent.to_string(),
            }),
            Ok(Err(AgentCallError::Timeout)) => {
                self.record_circuit(execution, agent, false);
                Err(EngineError::AgentTimeout {
                    agent: agent.to_string(),
                })
            }
            Ok(Err(AgentCallError::Transient { message })) => {
                self.record_circuit(execution, agent, false);
                Err(EngineError::AgentTransient {
                    agent: agent.to_string(),
                    message,
                })
            }
            Ok(Err(AgentCallError::Permanent { status, message })) => {
                Err(EngineError::AgentPermanent {
                    agent: agent.to_string(),
                    message: status.map_or(message.clone(), |code| format!("{code}: {message}")),
                })
            }
            Err(_elapsed) => {
                // Lease deadline passed without a response; revoke and fail.
                warn!(agent, step_id, "agent lease deadline passed; revoking");
                self.record_circuit(execution, agent, false);
                Err(EngineError::AgentTimeout {
                    agent: agent.to_string(),
                })
            }
        }
    }

    /// Best-effort cancel of an in-flight call.
    pub async fn cancel(&self, agent: &str, execution: &Execution, step_id: &str, attempt: u32) {
        let key = Self::idempotency_key(execution, step_id, attempt);
        if let Err(err) = self.client.cancel_task(agent, &key).await {
            warn!(agent, step_id, error = %err, "agent cancel failed; giving up");
        }
    }

    fn record_circuit(&self, execution: &Execution, agent: &str, success: bool) {
        if let Some(state) = self.circuits.record(agent, success) {
            self.bus.publish(&ExecutionEvent::new(
                execution.id,
                EventKind::CircuitStateChanged,
                json!({ "agent": agent, "state": state }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinity_core::traits::MockAgentClient;
    use trinity_core::{DefinitionRef, Origin};

    fn gateway_with(client: MockAgentClient) -> AgentGateway {
        AgentGateway::new(
            AgentLanes::new(3),
            Arc::new(CircuitRegistry::new(3, Duration::from_secs(60))),
            Arc::new(client),
            Arc::new(EventBus::new()),
            Duration::from_secs(5),
        )
    }

    fn execution() -> Execution {
        Execution::new(
            DefinitionRef::new("demo", "1"),
            Origin::manual("u1", Some("u1@x".into())),
            json!({}),
            json!({}),
        )
    }

    fn resolved(timeout: Duration) -> ResolvedAgentCall {
        ResolvedAgentCall {
            agent: "worker".into(),
            message: "hello".into(),
            model: Some("fast".into()),
            allowed_tools: vec!["search".into()],
            roles: vec![],
            timeout,
        }
    }

    #[tokio::test]
    async fn call_stamps_idempotency_key_and_origin_headers() {
        let mut client = MockAgentClient::new();
        client
            .expect_call_task()
            .withf(|request| {
                request.idempotency_key.ends_with(":analyze:2")
                    && request
                        .origin_headers
                        .iter()
                        .any(|(key, value)| key == "x-trinity-user-id" && value == "u1")
            })
            .returning(|_| {
                Ok(AgentResponse {
                    response: "done".into(),
                    duration: Duration::from_millis(3),
                    cost: Some(0.01),
                })
            });
        let gateway = gateway_with(client);

        let response = gateway
            .call(&execution(), "analyze", 2, &resolved(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(response.response, "done");
    }

    #[tokio::test]
    async fn transient_failures_feed_the_circuit() {
        let mut client = MockAgentClient::new();
        client
            .expect_call_task()
            .times(3)
            .returning(|_| Err(AgentCallError::Transient { message: "503".into() }));
        let gateway = gateway_with(client);
        let execution = execution();

        for _ in 0..3 {
            let err = gateway
                .call(&execution, "step", 1, &resolved(Duration::from_secs(5)))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::AgentTransient { .. }));
        }
        // The fourth call is refused without reaching the client.
        let err = gateway
            .call(&execution, "step", 1, &resolved(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn busy_does_not_count_toward_the_circuit() {
        let mut client = MockAgentClient::new();
        client
            .expect_call_task()
            .times(4)
            .returning(|_| Err(AgentCallError::Busy));
        let gateway = gateway_with(client);
        let execution = execution();

        for _ in 0..4 {
            let err = gateway
                .call(&execution, "step", 1, &resolved(Duration::from_secs(5)))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::AgentBusy { .. }));
        }
        assert!(gateway.circuits().snapshots().is_empty() || {
            let snapshot = &gateway.circuits().snapshots()[0];
            snapshot.state == crate::circuit::CircuitState::Closed
        });
    }
}
