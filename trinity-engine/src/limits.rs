//! ABOUTME: Execution concurrency caps: global and per-process
//! ABOUTME: Admission is compare-and-set; rejected submissions are never persisted

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trinity_core::{EngineError, Result};

/// Counts active executions and refuses submissions past the caps.
pub struct ConcurrencyLimits {
    global: AtomicUsize,
    per_process: DashMap<String, Arc<AtomicUsize>>,
    max_global: usize,
    max_per_process: usize,
}

impl ConcurrencyLimits {
    #[must_use]
    pub fn new(max_global: usize, max_per_process: usize) -> Self {
        Self {
            global: AtomicUsize::new(0),
            per_process: DashMap::new(),
            max_global,
            max_per_process,
        }
    }

    /// Admit one execution of `process_name`, or fail with `LimitExceeded`.
    /// `per_process_override` comes from the definition's config block.
    pub fn admit(
        &self,
        process_name: &str,
        per_process_override: Option<usize>,
    ) -> Result<(usize, usize)> {
        let max_process = per_process_override.unwrap_or(self.max_per_process);

        if self
            .global
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_global).then_some(n + 1)
            })
            .is_err()
        {
            return Err(EngineError::LimitExceeded {
                message: format!("global execution cap {} reached", self.max_global),
            });
        }

        let process = self
            .per_process
            .entry(process_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        if process
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_process).then_some(n + 1)
            })
            .is_err()
        {
            self.global.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::LimitExceeded {
                message: format!(
                    "per-process cap {max_process} reached for '{process_name}'"
                ),
            });
        }

        Ok((
            self.global.load(Ordering::SeqCst),
            process.load(Ordering::SeqCst),
        ))
    }

    /// Count an execution that is already running (recovery resume); not
    /// subject to the caps.
    pub fn register(&self, process_name: &str) {
        self.global.fetch_add(1, Ordering::SeqCst);
        self.per_process
            .entry(process_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Release one slot for `process_name`. Saturating; a release without
    /// a matching admit is a no-op.
    pub fn release(&self, process_name: &str) {
        if let Some(counter) = self.per_process.get(process_name) {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        let _ = self
            .global
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    #[must_use]
    pub fn active_global(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_for(&self, process_name: &str) -> usize {
        self.per_process
            .get(process_name)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }
}
