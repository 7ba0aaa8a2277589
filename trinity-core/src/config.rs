//! ABOUTME: Engine configuration with the documented defaults
//! ABOUTME: All knobs are programmatic; there is no layered file configuration

use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide configuration. Defaults match the documented operational
/// envelope; deployments override individual fields.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on concurrently active executions across all processes.
    pub max_global_executions: usize,
    /// Cap on concurrently active executions per process definition.
    pub max_per_process_executions: usize,
    /// Maximum queued (not yet running) calls per agent.
    pub agent_queue_max: usize,
    /// Consecutive failures that open an agent's circuit.
    pub circuit_failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe.
    pub circuit_cooldown: Duration,
    /// Executions older than this are forced to `timed_out`.
    pub max_execution_age: Duration,
    /// Step timeout applied when a step does not declare one.
    pub default_step_timeout: Duration,
    /// Maximum sub-process nesting depth.
    pub sub_process_max_depth: u32,
    /// Size cap for any single captured output variable.
    pub output_variable_max_bytes: usize,
    /// Grace period between signalling a running step and hard-cancelling it.
    pub cancel_grace: Duration,
    /// Slack added to a step's timeout when computing the agent lease deadline.
    pub agent_lease_slack: Duration,
    /// Webhook fires allowed per trigger id per minute.
    pub webhook_rate_per_minute: u32,
    /// Where audit events land when the audit backend rejects them.
    pub audit_fallback_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_global_executions: 50,
            max_per_process_executions: 3,
            agent_queue_max: 3,
            circuit_failure_threshold: 3,
            circuit_cooldown: Duration::from_secs(60),
            max_execution_age: Duration::from_secs(86_400),
            default_step_timeout: Duration::from_secs(300),
            sub_process_max_depth: 5,
            output_variable_max_bytes: 1024 * 1024,
            cancel_grace: Duration::from_secs(10),
            agent_lease_slack: Duration::from_secs(30),
            webhook_rate_per_minute: 60,
            audit_fallback_path: PathBuf::from("trinity-audit-fallback.jsonl"),
        }
    }
}

impl EngineConfig {
    /// Tightened limits and short waits for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            circuit_cooldown: Duration::from_millis(200),
            cancel_grace: Duration::from_millis(200),
            agent_lease_slack: Duration::from_millis(500),
            ..Self::default()
        }
    }
}
