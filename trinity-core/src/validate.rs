//! ABOUTME: Definition validator collecting every issue, not just the first
//! ABOUTME: Structural rules, DAG soundness, expression references, and sub-process depth

use crate::definition::{ProcessDefinition, StepKind, StepSpec, TriggerKind};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Maximum step/definition timeout: 24 hours.
const MAX_TIMEOUT_SECONDS: u64 = 86_400;
/// Maximum timer duration: 30 days.
const MAX_TIMER_SECONDS: u64 = 2_592_000;
/// Maximum sub-process nesting reachable from a definition.
const MAX_SUB_PROCESS_DEPTH: u32 = 5;

/// One structured validation problem, addressed by a path into the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Read access to the published definition registry, needed to validate
/// sub-process targets.
pub trait DefinitionLookup: Send + Sync {
    /// Latest published definition by name, or the exact version when given.
    fn published(&self, name: &str, version: Option<&str>) -> Option<Arc<ProcessDefinition>>;
}

/// Lookup over nothing; validates definitions that use no sub-processes.
pub struct NoDefinitions;

impl DefinitionLookup for NoDefinitions {
    fn published(&self, _name: &str, _version: Option<&str>) -> Option<Arc<ProcessDefinition>> {
        None
    }
}

/// Validate a definition against every rule, returning all issues found.
pub fn collect_issues(
    def: &ProcessDefinition,
    lookup: &dyn DefinitionLookup,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    check_names(def, &mut issues);
    check_triggers(def, &mut issues);
    check_step_ids(def, &mut issues);
    check_dependencies(def, &mut issues);
    check_gateways(def, &mut issues);
    check_expressions(def, &mut issues);
    check_bounds(def, &mut issues);
    check_sub_processes(def, lookup, &mut issues);
    issues
}

/// Validate a definition; `Err(InvalidDefinition)` carries every issue.
pub fn validate_definition(
    def: &ProcessDefinition,
    lookup: &dyn DefinitionLookup,
) -> crate::error::Result<()> {
    let issues = collect_issues(def, lookup);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidDefinition { issues })
    }
}

fn is_valid_process_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if !(2..=64).contains(&bytes.len()) {
        return false;
    }
    let first_ok = bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit();
    first_ok
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn is_valid_step_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if !(1..=64).contains(&bytes.len()) {
        return false;
    }
    bytes[0].is_ascii_lowercase()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn check_names(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    if !is_valid_process_name(&def.name) {
        issues.push(ValidationIssue::new(
            "name",
            format!("'{}' must match [a-z0-9][a-z0-9-]{{1,63}}", def.name),
        ));
    }
    if def.version.trim().is_empty() {
        issues.push(ValidationIssue::new("version", "must be non-empty"));
    }
}

fn check_triggers(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    for (index, trigger) in def.triggers.iter().enumerate() {
        let path = format!("triggers[{index}]");
        if !seen.insert(trigger.id.as_str()) {
            issues.push(ValidationIssue::new(
                &path,
                format!("duplicate trigger id '{}'", trigger.id),
            ));
        }
        if trigger.kind == TriggerKind::Schedule {
            match &trigger.cron {
                None => issues.push(ValidationIssue::new(
                    &path,
                    "schedule trigger requires a cron expression",
                )),
                Some(expr) => {
                    if expr.split_whitespace().count() != 5 {
                        issues.push(ValidationIssue::new(
                            &path,
                            format!("cron '{expr}' must have exactly 5 fields"),
                        ));
                    } else if cron::Schedule::from_str(&format!("0 {expr}")).is_err() {
                        issues.push(ValidationIssue::new(
                            &path,
                            format!("cron '{expr}' does not parse"),
                        ));
                    }
                }
            }
            match &trigger.timezone {
                None => issues.push(ValidationIssue::new(
                    &path,
                    "schedule trigger requires an IANA timezone",
                )),
                Some(tz) => {
                    if tz.parse::<chrono_tz::Tz>().is_err() {
                        issues.push(ValidationIssue::new(
                            &path,
                            format!("unknown timezone '{tz}'"),
                        ));
                    }
                }
            }
        }
    }
}

fn check_step_ids(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    for step in &def.steps {
        if !is_valid_step_id(&step.id) {
            issues.push(ValidationIssue::new(
                format!("steps.{}", step.id),
                "step id must match [a-z][a-z0-9-]{0,63}",
            ));
        }
        if !seen.insert(step.id.as_str()) {
            issues.push(ValidationIssue::new(
                format!("steps.{}", step.id),
                "duplicate step id",
            ));
        }
    }
}

/// Forward edges of the routing graph: `depends_on` plus gateway `next`.
fn forward_edges(def: &ProcessDefinition) -> HashMap<&str, Vec<&str>> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &def.steps {
        for dep in &step.depends_on {
            edges.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
        for target in step.gateway_targets() {
            edges.entry(step.id.as_str()).or_default().push(target);
        }
    }
    edges
}

fn check_dependencies(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    let ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &def.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("steps.{}.depends_on", step.id),
                    format!("unknown step '{dep}'"),
                ));
            }
            if dep == &step.id {
                issues.push(ValidationIssue::new(
                    format!("steps.{}.depends_on", step.id),
                    "step depends on itself",
                ));
            }
        }
    }

    // Cycle detection over depends_on plus gateway routing edges.
    let edges = forward_edges(def);
    let mut state: HashMap<&str, u8> = HashMap::new(); // 1 = visiting, 2 = done
    for step in &def.steps {
        if has_cycle(step.id.as_str(), &edges, &mut state) {
            issues.push(ValidationIssue::new(
                "steps",
                format!("dependency cycle involving '{}'", step.id),
            ));
            break;
        }
    }
}

fn has_cycle<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    state: &mut HashMap<&'a str, u8>,
) -> bool {
    match state.get(node) {
        Some(1) => return true,
        Some(2) => return false,
        _ => {}
    }
    state.insert(node, 1);
    if let Some(nexts) = edges.get(node) {
        for next in nexts {
            if has_cycle(next, edges, state) {
                return true;
            }
        }
    }
    state.insert(node, 2);
    false
}

fn check_gateways(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    let ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &def.steps {
        let StepKind::Gateway { conditions } = &step.kind else {
            continue;
        };
        let path = format!("steps.{}.conditions", step.id);
        if conditions.is_empty() {
            issues.push(ValidationIssue::new(&path, "gateway needs at least one condition"));
        }
        let defaults = conditions.iter().filter(|c| c.default).count();
        if defaults > 1 {
            issues.push(ValidationIssue::new(&path, "more than one default entry"));
        }
        for condition in conditions {
            if !condition.default && condition.expression.is_none() {
                issues.push(ValidationIssue::new(
                    &path,
                    format!("entry routing to '{}' needs an expression or default", condition.next),
                ));
            }
            if !ids.contains(condition.next.as_str()) {
                issues.push(ValidationIssue::new(
                    &path,
                    format!("next '{}' is not a step", condition.next),
                ));
            }
        }
    }
}

/// Ancestor closure of a step over depends_on and gateway edges.
fn ancestors<'a>(def: &'a ProcessDefinition, step_id: &str) -> HashSet<&'a str> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &def.steps {
        for dep in &step.depends_on {
            reverse.entry(step.id.as_str()).or_default().push(dep.as_str());
        }
        for target in step.gateway_targets() {
            reverse.entry(target).or_default().push(step.id.as_str());
        }
    }
    let mut out = HashSet::new();
    let mut stack: Vec<&str> = reverse.get(step_id).cloned().unwrap_or_default();
    while let Some(node) = stack.pop() {
        if out.insert(node) {
            if let Some(parents) = reverse.get(node) {
                stack.extend(parents.iter().copied());
            }
        }
    }
    out
}

/// All templated strings carried by a step, with their document paths.
fn step_expressions(step: &StepSpec) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let base = format!("steps.{}", step.id);
    if let Some(condition) = &step.condition {
        out.push((format!("{base}.condition"), condition.clone()));
    }
    match &step.kind {
        StepKind::AgentTask {
            message,
            model,
            allowed_tools,
            ..
        } => {
            out.push((format!("{base}.message"), message.clone()));
            if let Some(model) = model {
                out.push((format!("{base}.model"), model.clone()));
            }
            for (index, tool) in allowed_tools.iter().enumerate() {
                out.push((format!("{base}.allowed_tools[{index}]"), tool.clone()));
            }
        }
        StepKind::HumanApproval { title, description, .. } => {
            out.push((format!("{base}.title"), title.clone()));
            out.push((format!("{base}.description"), description.clone()));
        }
        StepKind::Gateway { conditions } => {
            for (index, condition) in conditions.iter().enumerate() {
                if let Some(expression) = &condition.expression {
                    out.push((format!("{base}.conditions[{index}]"), expression.clone()));
                }
            }
        }
        StepKind::Notification { message, .. } => {
            out.push((format!("{base}.message"), message.clone()));
        }
        StepKind::SubProcess { input_mapping, .. } => {
            for (key, template) in input_mapping {
                out.push((format!("{base}.input_mapping.{key}"), template.clone()));
            }
        }
        StepKind::Timer { .. } => {}
    }
    out
}

fn check_expressions(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    let ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();

    let mut check = |path: &str,
                     source: &str,
                     closure: Option<&HashSet<&str>>,
                     issues: &mut Vec<ValidationIssue>| {
        // Conditions are bare expressions; everything else is a template.
        let template = if path.ends_with(".condition") || path.contains(".conditions[") {
            let trimmed = source.trim();
            let inner = trimmed
                .strip_prefix("{{")
                .and_then(|s| s.strip_suffix("}}"))
                .unwrap_or(trimmed);
            trinity_expr::parse_expr(inner).map(|expr| trinity_expr::Template {
                parts: vec![trinity_expr::TemplatePart::Expr(expr)],
            })
        } else {
            trinity_expr::parse_template(source)
        };
        let template = match template {
            Ok(template) => template,
            Err(err) => {
                issues.push(ValidationIssue::new(path, err.to_string()));
                return;
            }
        };
        for segments in template.referenced_paths() {
            let Some(trinity_expr::Segment::Key(root)) = segments.first() else {
                continue;
            };
            match root.as_str() {
                "input" | "trigger" => {}
                "steps" => {
                    let Some(trinity_expr::Segment::Key(step_id)) = segments.get(1) else {
                        issues.push(ValidationIssue::new(path, "steps reference needs a step id"));
                        continue;
                    };
                    if !ids.contains(step_id.as_str()) {
                        issues.push(ValidationIssue::new(
                            path,
                            format!("references unknown step '{step_id}'"),
                        ));
                    } else if let Some(closure) = closure {
                        if !closure.contains(step_id.as_str()) {
                            issues.push(ValidationIssue::new(
                                path,
                                format!("references step '{step_id}' outside its dependency closure"),
                            ));
                        }
                    }
                }
                other => issues.push(ValidationIssue::new(
                    path,
                    format!("unknown root '{other}' (expected input, trigger, or steps)"),
                )),
            }
        }
    };

    for step in &def.steps {
        let closure = ancestors(def, &step.id);
        for (path, source) in step_expressions(step) {
            check(&path, &source, Some(&closure), issues);
        }
    }
    for (index, output) in def.outputs.iter().enumerate() {
        check(&format!("outputs[{index}]"), &output.source, None, issues);
    }
}

fn check_bounds(def: &ProcessDefinition, issues: &mut Vec<ValidationIssue>) {
    for step in &def.steps {
        let base = format!("steps.{}", step.id);
        if let Some(retry) = &step.retry {
            if !(1..=10).contains(&retry.max_attempts) {
                issues.push(ValidationIssue::new(
                    format!("{base}.retry.max_attempts"),
                    "must be between 1 and 10",
                ));
            }
        }
        if let Some(timeout) = step.timeout_seconds {
            if timeout > MAX_TIMEOUT_SECONDS {
                issues.push(ValidationIssue::new(
                    format!("{base}.timeout_seconds"),
                    "must be at most 24 hours",
                ));
            }
        }
        if let StepKind::Timer { duration_seconds } = &step.kind {
            if *duration_seconds > MAX_TIMER_SECONDS {
                issues.push(ValidationIssue::new(
                    format!("{base}.duration_seconds"),
                    "must be at most 30 days",
                ));
            }
        }
        if let StepKind::Notification { channels, .. } = &step.kind {
            if channels.is_empty() {
                issues.push(ValidationIssue::new(
                    format!("{base}.channels"),
                    "notification needs at least one channel",
                ));
            }
        }
    }
}

fn check_sub_processes(
    def: &ProcessDefinition,
    lookup: &dyn DefinitionLookup,
    issues: &mut Vec<ValidationIssue>,
) {
    for step in &def.steps {
        let StepKind::SubProcess { process, .. } = &step.kind else {
            continue;
        };
        let path = format!("steps.{}.process", step.id);
        let Some(target) = lookup.published(&process.name, process.version.as_deref()) else {
            issues.push(ValidationIssue::new(
                &path,
                format!("no published definition '{}'", process.name),
            ));
            continue;
        };
        // Walk the sub-process chain; depth past the cap (or unbounded
        // recursion, which exhausts the cap) is rejected here.
        let mut depth = 1u32;
        let mut frontier = vec![target];
        while !frontier.is_empty() {
            if depth > MAX_SUB_PROCESS_DEPTH {
                issues.push(ValidationIssue::new(
                    &path,
                    format!("sub-process nesting exceeds depth {MAX_SUB_PROCESS_DEPTH}"),
                ));
                break;
            }
            let mut next = Vec::new();
            for current in &frontier {
                for inner in &current.steps {
                    if let StepKind::SubProcess { process, .. } = &inner.kind {
                        if let Some(found) =
                            lookup.published(&process.name, process.version.as_deref())
                        {
                            next.push(found);
                        }
                    }
                }
            }
            depth += 1;
            frontier = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessDefinition;

    fn validate(yaml: &str) -> Vec<ValidationIssue> {
        let def = ProcessDefinition::from_yaml(yaml).unwrap();
        collect_issues(&def, &NoDefinitions)
    }

    #[test]
    fn accepts_well_formed_definition() {
        let issues = validate(
            r#"
name: good-flow
version: "1"
triggers:
  - id: nightly
    kind: schedule
    cron: "0 2 * * *"
    timezone: Europe/Berlin
steps:
  - id: fetch
    type: agent_task
    agent: fetcher
    message: "Fetch {{input.url | default:'https://example.com'}}"
  - id: decide
    type: gateway
    depends_on: [fetch]
    conditions:
      - expression: "steps.fetch.output contains 'ok'"
        next: done
      - default: true
        next: alert
  - id: done
    type: timer
    depends_on: []
    duration_seconds: 5
  - id: alert
    type: notification
    channels: [slack]
    message: "fetch failed"
outputs:
  - name: result
    source: "{{steps.fetch.output}}"
"#,
        );
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn collects_multiple_issues_at_once() {
        let issues = validate(
            r#"
name: "BAD NAME"
version: ""
steps:
  - id: Step-One
    type: timer
    duration_seconds: 9999999
  - id: two
    type: agent_task
    agent: a
    message: "{{steps.missing.output}}"
    depends_on: [ghost]
"#,
        );
        let text = issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        assert!(issues.len() >= 5, "expected many issues, got: {text}");
        assert!(text.contains("name"));
        assert!(text.contains("version"));
        assert!(text.contains("duration_seconds"));
        assert!(text.contains("ghost"));
        assert!(text.contains("missing"));
    }

    #[test]
    fn rejects_cycles_through_gateway_edges() {
        let issues = validate(
            r#"
name: loopy
version: "1"
steps:
  - id: a
    type: gateway
    conditions:
      - default: true
        next: b
  - id: b
    type: timer
    duration_seconds: 1
    depends_on: [a]
  - id: c
    type: timer
    duration_seconds: 1
    depends_on: [b]
"#,
        );
        assert!(issues.is_empty());

        let issues = validate(
            r#"
name: loopy
version: "1"
steps:
  - id: a
    type: timer
    duration_seconds: 1
    depends_on: [b]
  - id: b
    type: timer
    duration_seconds: 1
    depends_on: [a]
"#,
        );
        assert!(issues.iter().any(|i| i.message.contains("cycle")));
    }

    #[test]
    fn rejects_bad_cron_and_timezone() {
        let issues = validate(
            r#"
name: scheduled
version: "1"
triggers:
  - id: bad
    kind: schedule
    cron: "not a cron"
    timezone: Mars/Olympus
steps:
  - id: run
    type: timer
    duration_seconds: 1
"#,
        );
        assert!(issues.iter().any(|i| i.message.contains("cron")));
        assert!(issues.iter().any(|i| i.message.contains("timezone") || i.message.contains("Mars")));
    }

    #[test]
    fn rejects_double_default_gateway() {
        let issues = validate(
            r#"
name: router
version: "1"
steps:
  - id: g
    type: gateway
    conditions:
      - default: true
        next: a
      - default: true
        next: a
  - id: a
    type: timer
    duration_seconds: 1
"#,
        );
        assert!(issues.iter().any(|i| i.message.contains("default")));
    }

    #[test]
    fn rejects_retry_out_of_bounds() {
        let issues = validate(
            r#"
name: retrier
version: "1"
steps:
  - id: a
    type: agent_task
    agent: x
    message: hi
    retry:
      max_attempts: 11
"#,
        );
        assert!(issues.iter().any(|i| i.path.contains("max_attempts")));
    }

    #[test]
    fn rejects_reference_outside_dependency_closure() {
        let issues = validate(
            r#"
name: closure-check
version: "1"
steps:
  - id: a
    type: agent_task
    agent: x
    message: hi
  - id: b
    type: agent_task
    agent: x
    message: "uses {{steps.a.output}}"
"#,
        );
        assert!(issues.iter().any(|i| i.message.contains("closure")));
    }

    #[test]
    fn sub_process_target_must_be_published() {
        let issues = validate(
            r#"
name: parent
version: "1"
steps:
  - id: child
    type: sub_process
    process:
      name: missing-child
"#,
        );
        assert!(issues.iter().any(|i| i.message.contains("no published definition")));
    }
}
