//! ABOUTME: Core types and infrastructure for the Trinity process engine
//! ABOUTME: Foundation layer providing definitions, executions, events, config, and collaborator traits

pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod execution;
pub mod traits;
pub mod validate;

// Re-export commonly used types
pub use config::EngineConfig;
pub use definition::{
    BackoffKind, DefinitionRef, DefinitionStatus, GatewayCondition, OutputSpec, ProcessConfig,
    ProcessDefinition, ProcessRef, RetrySpec, StepKind, StepSpec, TimeoutAction, TriggerKind,
    TriggerSpec,
};
pub use error::{EngineError, FailureKind, Result, StepFailure};
pub use events::{EventKind, ExecutionEvent};
pub use execution::{
    ApprovalDecision, ApprovalStatus, ApprovalTask, AwaitKind, Execution, ExecutionId,
    ExecutionStatus, Origin, OriginKind, StepExecution, StepStatus,
};
pub use traits::{
    AgentCallError, AgentClient, AgentRequest, AgentResponse, ApprovalNotifier, AuditPriority,
    AuditSink, Notifier, RecipientStatus,
};
pub use validate::{validate_definition, DefinitionLookup, NoDefinitions, ValidationIssue};
