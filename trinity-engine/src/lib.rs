//! ABOUTME: Execution runtime for the Trinity process engine
//! ABOUTME: Scheduler, step handlers, per-agent gateway, triggers, limits, and recovery

pub mod agents;
pub mod approvals;
pub mod auth;
pub mod circuit;
pub mod engine;
pub mod handlers;
pub mod lane;
pub mod limits;
pub mod null;
pub mod pipeline;
pub mod recovery;
pub mod retry;
pub(crate) mod scheduler;
pub mod store;
pub mod triggers;

pub use agents::AgentGateway;
pub use auth::{Actor, Permission, Role};
pub use circuit::{CircuitRegistry, CircuitSnapshot, CircuitState};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use null::{NullAgentClient, NullApprovalNotifier, NullAuditSink, NullNotifier};
pub use recovery::RecoveryReport;
pub use store::{ExecutionFilter, MemoryStateStore, StateStore};
