// ABOUTME: Audit pipeline: synchronous-with-retry critical writes, local fallback file
// ABOUTME: Normal events never block the engine; critical failures refuse the caller

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use trinity_core::{AuditPriority, AuditSink, EngineError, ExecutionEvent};

/// Attempts against the audit backend before falling back.
const SINK_ATTEMPTS: u32 = 3;
/// Delay between audit backend attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Audit front-end. Every engine event goes through [`AuditLog::record`];
/// the backend's availability decides whether the caller proceeds.
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    fallback_path: PathBuf,
    fallback_lock: Mutex<()>,
}

impl AuditLog {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, fallback_path: PathBuf) -> Self {
        Self {
            sink,
            fallback_path,
            fallback_lock: Mutex::new(()),
        }
    }

    /// Record an event. Critical events are written synchronously with
    /// retry; when the backend stays down they land in the fallback file
    /// and the originating operation is refused with `AuditUnavailable`.
    /// Normal events fall back silently and never fail the caller.
    pub async fn record(&self, event: &ExecutionEvent) -> trinity_core::Result<()> {
        let priority = if event.kind.is_critical() {
            AuditPriority::Critical
        } else {
            AuditPriority::Normal
        };

        let attempts = match priority {
            AuditPriority::Critical => SINK_ATTEMPTS,
            AuditPriority::Normal => 1,
        };

        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.sink.log(event, priority).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        event = %event.kind,
                        attempt,
                        error = %err,
                        "audit backend rejected event"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        self.write_fallback(event);

        match priority {
            AuditPriority::Critical => Err(EngineError::AuditUnavailable {
                message: last_error
                    .map_or_else(|| "unknown audit failure".to_string(), |e| e.to_string()),
            }),
            AuditPriority::Normal => Ok(()),
        }
    }

    /// Append the event to the local fallback file as a JSON line.
    fn write_fallback(&self, event: &ExecutionEvent) {
        let _guard = self.fallback_lock.lock();
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "audit fallback serialization failed");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            error!(
                path = %self.fallback_path.display(),
                error = %err,
                "audit fallback write failed; event lost from local log"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use trinity_core::EventKind;
    use ulid::Ulid;

    struct FlakySink {
        failures: AtomicU32,
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn log(
            &self,
            _event: &ExecutionEvent,
            _priority: AuditPriority,
        ) -> anyhow::Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("backend down")
            }
            Ok(())
        }
    }

    struct DeadSink;

    #[async_trait]
    impl AuditSink for DeadSink {
        async fn log(
            &self,
            _event: &ExecutionEvent,
            _priority: AuditPriority,
        ) -> anyhow::Result<()> {
            anyhow::bail!("backend down")
        }
    }

    fn critical_event() -> ExecutionEvent {
        ExecutionEvent::new(Ulid::new(), EventKind::ExecutionFailed, json!({}))
    }

    fn normal_event() -> ExecutionEvent {
        ExecutionEvent::new(Ulid::new(), EventKind::StepStarted, json!({}))
    }

    #[tokio::test]
    async fn critical_write_retries_through_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(
            Arc::new(FlakySink {
                failures: AtomicU32::new(2),
            }),
            dir.path().join("fallback.jsonl"),
        );
        assert!(log.record(&critical_event()).await.is_ok());
    }

    #[tokio::test]
    async fn critical_write_fails_and_falls_back_when_backend_dead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.jsonl");
        let log = AuditLog::new(Arc::new(DeadSink), path.clone());

        let err = log.record(&critical_event()).await.unwrap_err();
        assert!(matches!(err, EngineError::AuditUnavailable { .. }));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("execution_failed"));
    }

    #[tokio::test]
    async fn normal_write_proceeds_despite_dead_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.jsonl");
        let log = AuditLog::new(Arc::new(DeadSink), path.clone());

        assert!(log.record(&normal_event()).await.is_ok());
        assert!(std::fs::read_to_string(&path).unwrap().contains("step_started"));
    }
}
