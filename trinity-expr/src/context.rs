//! ABOUTME: Evaluation context exposing input, trigger, and per-step views
//! ABOUTME: Agent string outputs are JSON-parsed at most once and cached

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Snapshot of one completed (or in-flight) step as seen by expressions:
/// `steps.<id>.{output, status, duration, started_at, completed_at}`.
#[derive(Debug)]
pub struct StepSnapshot {
    output: Json,
    status: String,
    duration_ms: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    /// Lazy parse of a string output that happens to be JSON. `None` inside
    /// the cell means the string did not parse.
    parsed_output: OnceLock<Option<Json>>,
}

impl StepSnapshot {
    #[must_use]
    pub fn new(
        output: Json,
        status: impl Into<String>,
        duration_ms: Option<u64>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            output,
            status: status.into(),
            duration_ms,
            started_at,
            completed_at,
            parsed_output: OnceLock::new(),
        }
    }

    /// The raw output value.
    #[must_use]
    pub const fn output(&self) -> &Json {
        &self.output
    }

    /// The output with string-wrapped JSON unwrapped, parsing at most once.
    /// Returns `None` when the output is a string that is not valid JSON;
    /// dotted paths against such an output resolve to missing.
    #[must_use]
    pub fn structured_output(&self) -> Option<&Json> {
        match &self.output {
            Json::String(text) => self
                .parsed_output
                .get_or_init(|| serde_json::from_str(text).ok())
                .as_ref(),
            other => Some(other),
        }
    }

    /// Resolve a field of the step view by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Json> {
        match name {
            "output" => Some(self.output.clone()),
            "status" => Some(Json::String(self.status.clone())),
            "duration" => self.duration_ms.map(Json::from),
            "started_at" => self.started_at.map(|t| Json::String(t.to_rfc3339())),
            "completed_at" => self.completed_at.map(|t| Json::String(t.to_rfc3339())),
            _ => None,
        }
    }
}

/// Everything an expression can see during one evaluation. The context is
/// immutable; the evaluator is pure against it.
#[derive(Debug, Default)]
pub struct EvalContext {
    input: Json,
    trigger: Json,
    steps: HashMap<String, StepSnapshot>,
}

impl EvalContext {
    #[must_use]
    pub fn new(input: Json, trigger: Json) -> Self {
        Self {
            input,
            trigger,
            steps: HashMap::new(),
        }
    }

    /// Attach a step snapshot under its step id.
    pub fn insert_step(&mut self, step_id: impl Into<String>, snapshot: StepSnapshot) {
        self.steps.insert(step_id.into(), snapshot);
    }

    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>, snapshot: StepSnapshot) -> Self {
        self.insert_step(step_id, snapshot);
        self
    }

    #[must_use]
    pub const fn input(&self) -> &Json {
        &self.input
    }

    #[must_use]
    pub const fn trigger(&self) -> &Json {
        &self.trigger
    }

    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepSnapshot> {
        self.steps.get(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_output_parses_json_strings_once() {
        let snapshot = StepSnapshot::new(json!("{\"score\": 9}"), "succeeded", None, None, None);
        let first = snapshot.structured_output().cloned();
        let second = snapshot.structured_output().cloned();
        assert_eq!(first, Some(json!({"score": 9})));
        assert_eq!(first, second);
    }

    #[test]
    fn structured_output_none_for_plain_text() {
        let snapshot = StepSnapshot::new(json!("just words"), "succeeded", None, None, None);
        assert!(snapshot.structured_output().is_none());
    }

    #[test]
    fn object_output_passes_through() {
        let snapshot = StepSnapshot::new(json!({"a": 1}), "succeeded", None, None, None);
        assert_eq!(snapshot.structured_output(), Some(&json!({"a": 1})));
    }
}
