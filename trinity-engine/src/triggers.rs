//! ABOUTME: Trigger sources: webhook rate limiting and the cron runner
//! ABOUTME: Schedule fires dedupe through a guard so replicas do not double-fire

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trinity_core::{DefinitionRef, EngineError, ExecutionId, Result, TriggerSpec};

/// Sliding-window rate limiter keyed by webhook trigger id.
pub struct WebhookRateLimiter {
    hits: DashMap<String, Mutex<VecDeque<Instant>>>,
    window: Duration,
    max_per_window: u32,
}

impl WebhookRateLimiter {
    #[must_use]
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            hits: DashMap::new(),
            window: Duration::from_secs(60),
            max_per_window: max_per_minute,
        }
    }

    /// Count a fire attempt; fails with `LimitExceeded` past the window cap.
    pub fn check(&self, trigger_id: &str) -> Result<()> {
        let entry = self.hits.entry(trigger_id.to_string()).or_default();
        let mut hits = entry.lock();
        let now = Instant::now();
        while hits
            .front()
            .is_some_and(|first| now.duration_since(*first) > self.window)
        {
            hits.pop_front();
        }
        if hits.len() >= self.max_per_window as usize {
            return Err(EngineError::LimitExceeded {
                message: format!("webhook trigger '{trigger_id}' is rate limited"),
            });
        }
        hits.push_back(now);
        Ok(())
    }
}

/// Replica coordination for schedule fires: at most one engine instance
/// may fire a given (trigger, occurrence) pair.
pub trait ScheduleGuard: Send + Sync {
    fn try_acquire(&self, trigger_id: &str, occurrence: DateTime<Utc>) -> bool;
}

/// Single-process guard; distributed deployments swap in a lock backed by
/// their coordination store.
#[derive(Default)]
pub struct LocalScheduleGuard {
    fired: DashMap<String, DateTime<Utc>>,
}

impl ScheduleGuard for LocalScheduleGuard {
    fn try_acquire(&self, trigger_id: &str, occurrence: DateTime<Utc>) -> bool {
        match self.fired.entry(trigger_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() < occurrence {
                    entry.insert(occurrence);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(occurrence);
                true
            }
        }
    }
}

/// What the cron runner needs from the engine.
#[async_trait]
pub trait ScheduleTarget: Send + Sync {
    /// Every schedule trigger on a published definition.
    fn schedule_triggers(&self) -> Vec<(DefinitionRef, TriggerSpec)>;
    /// Fire one schedule occurrence.
    async fn fire_schedule(
        &self,
        definition: DefinitionRef,
        trigger: &TriggerSpec,
        occurrence: DateTime<Utc>,
    ) -> Result<ExecutionId>;
}

/// Periodic evaluator for schedule triggers. Each tick fires every
/// occurrence that fell due since the last tick, in the trigger's
/// timezone, deduped through the guard.
pub struct CronRunner {
    target: Arc<dyn ScheduleTarget>,
    guard: Arc<dyn ScheduleGuard>,
    tick_interval: Duration,
}

impl CronRunner {
    #[must_use]
    pub fn new(target: Arc<dyn ScheduleTarget>, guard: Arc<dyn ScheduleGuard>) -> Self {
        Self {
            target,
            guard,
            tick_interval: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Run until shutdown.
    pub fn spawn(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut last_check = Utc::now();
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let now = Utc::now();
                self.fire_due(last_check, now).await;
                last_check = now;
            }
        });
    }

    async fn fire_due(&self, since: DateTime<Utc>, until: DateTime<Utc>) {
        for (definition, trigger) in self.target.schedule_triggers() {
            for occurrence in due_occurrences(&trigger, since, until) {
                if !self.guard.try_acquire(&trigger.id, occurrence) {
                    debug!(trigger = %trigger.id, "schedule occurrence already claimed");
                    continue;
                }
                match self
                    .target
                    .fire_schedule(definition.clone(), &trigger, occurrence)
                    .await
                {
                    Ok(execution_id) => {
                        debug!(trigger = %trigger.id, %execution_id, "schedule fired");
                    }
                    Err(err) => {
                        warn!(trigger = %trigger.id, error = %err, "schedule fire failed");
                    }
                }
            }
        }
    }
}

/// Occurrences of a schedule trigger in `(since, until]`, evaluated in the
/// trigger's timezone.
fn due_occurrences(
    trigger: &TriggerSpec,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let (Some(expr), Some(tz_name)) = (&trigger.cron, &trigger.timezone) else {
        return Vec::new();
    };
    let Ok(tz) = tz_name.parse::<chrono_tz::Tz>() else {
        return Vec::new();
    };
    // The validator guarantees 5 fields; the cron crate wants seconds.
    let Ok(schedule) = cron::Schedule::from_str(&format!("0 {expr}")) else {
        return Vec::new();
    };
    schedule
        .after(&since.with_timezone(&tz))
        .take_while(|occurrence| occurrence.with_timezone(&Utc) <= until)
        .map(|occurrence| occurrence.with_timezone(&Utc))
        .collect()
}

/// Webhook trigger payload as exposed to expressions under `trigger.*`.
#[must_use]
pub fn webhook_trigger_context(trigger_id: &str, body: &Json, source_ip: &str) -> Json {
    serde_json::json!({
        "id": trigger_id,
        "kind": "webhook",
        "body": body,
        "source_ip": source_ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinity_core::TriggerKind;

    #[test]
    fn rate_limiter_caps_within_window() {
        let limiter = WebhookRateLimiter::new(2);
        limiter.check("hook").unwrap();
        limiter.check("hook").unwrap();
        assert!(matches!(
            limiter.check("hook").unwrap_err(),
            EngineError::LimitExceeded { .. }
        ));
        // Other triggers have their own window.
        limiter.check("other").unwrap();
    }

    #[test]
    fn local_guard_fires_each_occurrence_once() {
        let guard = LocalScheduleGuard::default();
        let occurrence = Utc::now();
        assert!(guard.try_acquire("nightly", occurrence));
        assert!(!guard.try_acquire("nightly", occurrence));
        assert!(guard.try_acquire("nightly", occurrence + chrono::Duration::minutes(1)));
    }

    #[test]
    fn due_occurrences_respects_window_and_timezone() {
        let trigger = TriggerSpec {
            id: "every-minute".into(),
            kind: TriggerKind::Schedule,
            cron: Some("* * * * *".into()),
            timezone: Some("UTC".into()),
            input: None,
        };
        let since = Utc::now();
        let until = since + chrono::Duration::seconds(130);
        let due = due_occurrences(&trigger, since, until);
        assert!((2..=3).contains(&due.len()), "got {}", due.len());

        let none = due_occurrences(&trigger, since, since);
        assert!(none.is_empty());
    }
}
