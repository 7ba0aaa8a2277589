//! ABOUTME: Error types and handling for the Trinity process engine
//! ABOUTME: Provides the closed EngineError enum, step failure records, and Result alias

use crate::validate::ValidationIssue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Comprehensive error enum for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid definition: {}", format_issues(.issues))]
    InvalidDefinition { issues: Vec<ValidationIssue> },

    #[error("expression error in step '{step_id}': {message}")]
    Expression { step_id: String, message: String },

    #[error("agent '{agent}' queue is full")]
    AgentBusy { agent: String },

    #[error("circuit open for agent '{agent}'")]
    CircuitOpen { agent: String },

    #[error("agent '{agent}' timed out")]
    AgentTimeout { agent: String },

    #[error("transient agent failure on '{agent}': {message}")]
    AgentTransient { agent: String, message: String },

    #[error("permanent agent failure on '{agent}': {message}")]
    AgentPermanent { agent: String, message: String },

    #[error("step '{step_id}' timed out on attempt {attempt}")]
    StepTimeout { step_id: String, attempt: u32 },

    #[error("step '{step_id}' failed because dependency '{dependency}' failed")]
    DependencyFailed { step_id: String, dependency: String },

    #[error("gateway '{step_id}' matched no condition and has no default")]
    NoGatewayMatch { step_id: String },

    #[error("approval for step '{step_id}' expired")]
    ApprovalExpired { step_id: String },

    #[error("notification step '{step_id}' failed: no channel accepted the message")]
    NotificationFailed { step_id: String },

    #[error("sub-process nesting exceeds depth {max_depth}")]
    SubProcessTooDeep { max_depth: u32 },

    #[error("limit exceeded: {message}")]
    LimitExceeded { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("audit backend unavailable: {message}")]
    AuditUnavailable { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Whether a step retry policy may retry after this error. Circuit-open
    /// and permanent failures are never retried; busy, timeout, and
    /// transient failures count against the retry budget.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::AgentBusy { .. }
                | Self::AgentTimeout { .. }
                | Self::AgentTransient { .. }
                | Self::StepTimeout { .. }
                | Self::NotificationFailed { .. }
        )
    }

    /// Classify into the failure kind recorded on the step execution.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Expression { .. } => FailureKind::Expression,
            Self::AgentBusy { .. } => FailureKind::AgentBusy,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::AgentTimeout { .. } => FailureKind::AgentTimeout,
            Self::AgentTransient { .. } => FailureKind::Transient,
            Self::AgentPermanent { .. } => FailureKind::Permanent,
            Self::StepTimeout { .. } => FailureKind::StepTimeout,
            Self::DependencyFailed { .. } => FailureKind::DependencyFailed,
            Self::NoGatewayMatch { .. } => FailureKind::NoGatewayMatch,
            Self::ApprovalExpired { .. } => FailureKind::ApprovalExpired,
            Self::NotificationFailed { .. } => FailureKind::NotificationFailed,
            Self::SubProcessTooDeep { .. } => FailureKind::SubProcessTooDeep,
            Self::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure kind attached to failed step executions; the closed set of §7
/// error classes as users see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Expression,
    AgentBusy,
    CircuitOpen,
    AgentTimeout,
    Transient,
    Permanent,
    StepTimeout,
    DependencyFailed,
    NoGatewayMatch,
    ApprovalExpired,
    NotificationFailed,
    SubProcessTooDeep,
    Cancelled,
    Internal,
}

/// User-visible record of why a step failed: kind, short explanation, the
/// step at fault, and the attempt that sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    pub step_id: String,
    pub attempt: u32,
}

impl StepFailure {
    #[must_use]
    pub fn from_error(error: &EngineError, step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: error.failure_kind(),
            message: error.to_string(),
            step_id: step_id.into(),
            attempt,
        }
    }
}
