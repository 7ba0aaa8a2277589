//! ABOUTME: Declarative process definition model
//! ABOUTME: Definitions parse from YAML text; the step set is a closed tagged variant

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle status of a process definition. Published definitions are
/// immutable; changes require a new version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

/// Reference to a definition by name and version. Stable once published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub name: String,
    pub version: String,
}

impl DefinitionRef {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// How an execution gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Schedule,
}

/// One trigger entry on a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub id: String,
    pub kind: TriggerKind,
    /// 5-field cron expression, schedule triggers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA timezone name, schedule triggers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Static input merged into executions fired by this trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Json>,
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Per-step retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: u64,
}

const fn default_initial_delay_seconds() -> u64 {
    1
}

impl RetrySpec {
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }
}

/// What to do when a human approval deadline passes undecided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Skip,
    Approve,
    Reject,
}

/// One routing entry of a gateway. Entries are evaluated in order; the
/// first true expression wins; a `default: true` entry catches the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    pub next: String,
}

/// Target of a sub-process step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The closed set of step behaviors. Extending this enum is a deliberate
/// engine change, not a user extension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    AgentTask {
        agent: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allowed_tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        roles: Vec<String>,
    },
    HumanApproval {
        title: String,
        description: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approvers: Vec<String>,
        #[serde(default)]
        timeout_action: TimeoutAction,
    },
    Gateway {
        conditions: Vec<GatewayCondition>,
    },
    Timer {
        duration_seconds: u64,
    },
    Notification {
        channels: Vec<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        recipients: Vec<String>,
    },
    SubProcess {
        process: ProcessRef,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        input_mapping: BTreeMap<String, String>,
    },
}

impl StepKind {
    /// Short tag used in logs and events.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::AgentTask { .. } => "agent_task",
            Self::HumanApproval { .. } => "human_approval",
            Self::Gateway { .. } => "gateway",
            Self::Timer { .. } => "timer",
            Self::Notification { .. } => "notification",
            Self::SubProcess { .. } => "sub_process",
        }
    }
}

/// One step of a process: the common envelope plus the typed behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepSpec {
    /// The step's timeout, or the engine default when unset.
    #[must_use]
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        self.timeout_seconds.map_or(fallback, Duration::from_secs)
    }

    /// Gateway routing targets, empty for non-gateway steps.
    #[must_use]
    pub fn gateway_targets(&self) -> Vec<&str> {
        match &self.kind {
            StepKind::Gateway { conditions } => {
                conditions.iter().map(|c| c.next.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_gateway(&self) -> bool {
        matches!(self.kind, StepKind::Gateway { .. })
    }
}

/// Declared execution output: a name and the expression that produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub source: String,
}

/// Optional per-process configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<String>,
    /// Overrides the engine's per-process concurrency cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

/// A declarative workflow: triggers in, steps in dependency order, outputs
/// captured at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub status: DefinitionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerSpec>,
    pub steps: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ProcessConfig>,
}

impl ProcessDefinition {
    /// Parse a YAML document into an (unvalidated) definition.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::InvalidDefinition {
            issues: vec![crate::validate::ValidationIssue::new(
                "document",
                format!("parse error: {e}"),
            )],
        })
    }

    #[must_use]
    pub fn definition_ref(&self) -> DefinitionRef {
        DefinitionRef::new(self.name.clone(), self.version.clone())
    }

    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Source-order index of a step; drives stable dispatch ordering.
    #[must_use]
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    #[must_use]
    pub fn trigger(&self, id: &str) -> Option<&TriggerSpec> {
        self.triggers.iter().find(|t| t.id == id)
    }

    #[must_use]
    pub const fn is_published(&self) -> bool {
        matches!(self.status, DefinitionStatus::Published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE_YAML: &str = r#"
name: content-pipeline
version: "1.0"
triggers:
  - id: start
    kind: manual
steps:
  - id: research
    type: agent_task
    agent: researcher
    message: "Research {{input.topic}}"
    timeout_seconds: 120
    retry:
      max_attempts: 3
      backoff: exponential
      initial_delay_seconds: 2
  - id: write
    type: agent_task
    agent: writer
    message: "Write up: {{steps.research.output}}"
    depends_on: [research]
  - id: review
    type: human_approval
    title: Review draft
    description: "Approve the draft for {{input.topic}}"
    approvers: [alice@example.com]
    depends_on: [write]
    timeout_seconds: 86400
    timeout_action: skip
outputs:
  - name: final
    source: "{{steps.write.output}}"
"#;

    #[test]
    fn parses_yaml_pipeline() {
        let def = ProcessDefinition::from_yaml(PIPELINE_YAML).unwrap();
        assert_eq!(def.name, "content-pipeline");
        assert_eq!(def.status, DefinitionStatus::Draft);
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.step_index("write"), Some(1));

        let research = def.step("research").unwrap();
        assert_eq!(research.kind.type_name(), "agent_task");
        let retry = research.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff, BackoffKind::Exponential);

        let review = def.step("review").unwrap();
        match &review.kind {
            StepKind::HumanApproval { timeout_action, .. } => {
                assert_eq!(*timeout_action, TimeoutAction::Skip);
            }
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[test]
    fn gateway_targets_enumerates_next_ids() {
        let yaml = r#"
name: router
version: "1"
steps:
  - id: score
    type: agent_task
    agent: scorer
    message: score it
  - id: route
    type: gateway
    depends_on: [score]
    conditions:
      - expression: "steps.score.output.value >= 70"
        next: good
      - default: true
        next: bad
  - id: good
    type: timer
    duration_seconds: 1
  - id: bad
    type: timer
    duration_seconds: 1
"#;
        let def = ProcessDefinition::from_yaml(yaml).unwrap();
        let route = def.step("route").unwrap();
        assert!(route.is_gateway());
        assert_eq!(route.gateway_targets(), vec!["good", "bad"]);
    }

    #[test]
    fn malformed_yaml_reports_parse_issue() {
        let err = ProcessDefinition::from_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition { .. }));
    }

    #[test]
    fn definitions_round_trip_through_json() {
        let def = ProcessDefinition::from_yaml(PIPELINE_YAML).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let back: ProcessDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
    }
}
