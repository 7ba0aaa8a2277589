//! ABOUTME: Per-agent circuit breaker with consecutive-failure tripping
//! ABOUTME: Open circuits cool down, admit exactly one probe, then close or re-open

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::info;
use trinity_core::{EngineError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are blocked.
    Open,
    /// Circuit is half-open, one probe is testing recovery.
    HalfOpen,
}

/// Read-only view of one agent's circuit for operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitSnapshot {
    pub agent: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Registry of per-agent circuits. Shared across all schedulers; state
/// transitions happen under the per-agent lock so concurrent submitters
/// observe a consistent admit decision.
pub struct CircuitRegistry {
    circuits: DashMap<String, Mutex<Circuit>>,
    failure_threshold: u32,
    cooldown: ChronoDuration,
}

impl CircuitRegistry {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            circuits: DashMap::new(),
            failure_threshold,
            cooldown: ChronoDuration::from_std(cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
        }
    }

    /// Admit or reject a call for `agent`. After the cool-down an open
    /// circuit admits exactly one probe; everyone else keeps seeing
    /// `CircuitOpen` until the probe reports back.
    pub fn admit(&self, agent: &str) -> Result<()> {
        let entry = self.circuits.entry(agent.to_string()).or_default();
        let mut circuit = entry.lock();
        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .is_none_or(|at| Utc::now() - at >= self.cooldown);
                if cooled {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    info!(agent, "circuit half-open; admitting probe");
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen {
                        agent: agent.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Err(EngineError::CircuitOpen {
                        agent: agent.to_string(),
                    })
                } else {
                    circuit.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a call result. Returns the new state when it changed.
    pub fn record(&self, agent: &str, success: bool) -> Option<CircuitState> {
        let entry = self.circuits.entry(agent.to_string()).or_default();
        let mut circuit = entry.lock();
        let before = circuit.state;
        match (circuit.state, success) {
            (CircuitState::Closed, true) => {
                circuit.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Utc::now());
                }
            }
            (CircuitState::HalfOpen, true) => {
                circuit.state = CircuitState::Closed;
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
                circuit.probe_in_flight = false;
            }
            (CircuitState::HalfOpen, false) => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Utc::now());
                circuit.probe_in_flight = false;
            }
            (CircuitState::Open, _) => {
                // Late result from a call admitted before the trip.
            }
        }
        if circuit.state == before {
            None
        } else {
            info!(agent, from = ?before, to = ?circuit.state, "circuit state changed");
            Some(circuit.state)
        }
    }

    /// Manual reset to closed.
    pub fn reset(&self, agent: &str) -> Option<CircuitState> {
        let entry = self.circuits.entry(agent.to_string()).or_default();
        let mut circuit = entry.lock();
        let changed = circuit.state != CircuitState::Closed;
        *circuit = Circuit::default();
        if changed {
            info!(agent, "circuit manually reset");
            Some(CircuitState::Closed)
        } else {
            None
        }
    }

    /// Snapshot of every known agent circuit.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| {
                let circuit = entry.value().lock();
                CircuitSnapshot {
                    agent: entry.key().clone(),
                    state: circuit.state,
                    failure_count: circuit.consecutive_failures,
                    opened_at: circuit.opened_at,
                }
            })
            .collect();
        out.sort_by(|a, b| a.agent.cmp(&b.agent));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitRegistry {
        CircuitRegistry::new(3, Duration::from_millis(50))
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let circuits = registry();
        for _ in 0..2 {
            circuits.admit("worker").unwrap();
            assert!(circuits.record("worker", false).is_none());
        }
        circuits.admit("worker").unwrap();
        assert_eq!(circuits.record("worker", false), Some(CircuitState::Open));
        assert!(matches!(
            circuits.admit("worker").unwrap_err(),
            EngineError::CircuitOpen { .. }
        ));
    }

    #[test]
    fn success_resets_failure_streak() {
        let circuits = registry();
        circuits.record("worker", false);
        circuits.record("worker", false);
        circuits.record("worker", true);
        circuits.record("worker", false);
        circuits.record("worker", false);
        let snapshot = &circuits.snapshots()[0];
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 2);
    }

    #[test]
    fn cooldown_admits_exactly_one_probe() {
        let circuits = registry();
        for _ in 0..3 {
            circuits.record("worker", false);
        }
        assert!(circuits.admit("worker").is_err());

        std::thread::sleep(Duration::from_millis(60));
        // First admit becomes the probe, the next caller is still blocked.
        circuits.admit("worker").unwrap();
        assert!(circuits.admit("worker").is_err());

        // Probe success closes the circuit for everyone.
        assert_eq!(circuits.record("worker", true), Some(CircuitState::Closed));
        circuits.admit("worker").unwrap();
    }

    #[test]
    fn probe_failure_reopens() {
        let circuits = registry();
        for _ in 0..3 {
            circuits.record("worker", false);
        }
        std::thread::sleep(Duration::from_millis(60));
        circuits.admit("worker").unwrap();
        assert_eq!(circuits.record("worker", false), Some(CircuitState::Open));
        assert!(circuits.admit("worker").is_err());
    }

    #[test]
    fn manual_reset_closes() {
        let circuits = registry();
        for _ in 0..3 {
            circuits.record("worker", false);
        }
        assert!(circuits.admit("worker").is_err());
        assert_eq!(circuits.reset("worker"), Some(CircuitState::Closed));
        circuits.admit("worker").unwrap();
    }
}
