// ABOUTME: Event bus and audit pipeline for the Trinity process engine
// ABOUTME: Pattern-matched pub/sub over execution events plus critical-path audit writes

pub mod audit;
pub mod bus;
pub mod stream;

pub use audit::AuditLog;
pub use bus::{EventBus, SubscribeError};
pub use stream::EventStream;
