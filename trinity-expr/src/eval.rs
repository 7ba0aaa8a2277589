//! ABOUTME: Total evaluator for template expressions
//! ABOUTME: Missing references evaluate to Missing, never to an error

use crate::ast::{CompareOp, Expr, Segment, TemplatePart};
use crate::context::EvalContext;
use crate::parser::{parse_expr, parse_template};
use crate::value::EvalValue;
use crate::Result;
use serde_json::Value as Json;

/// Evaluate a single expression AST against a context.
#[must_use]
pub fn eval_expr(expr: &Expr, ctx: &EvalContext) -> EvalValue {
    match expr {
        Expr::Path(segments) => resolve_path(segments, ctx),
        Expr::Str(s) => EvalValue::Json(Json::String(s.clone())),
        Expr::Num(n) => serde_json::Number::from_f64(*n)
            .map_or(EvalValue::Missing, |n| EvalValue::Json(Json::Number(n))),
        Expr::Bool(b) => EvalValue::Json(Json::Bool(*b)),
        Expr::Default { value, fallback } => {
            let resolved = eval_expr(value, ctx);
            if resolved.is_empty() {
                eval_expr(fallback, ctx)
            } else {
                resolved
            }
        }
        Expr::Compare { op, lhs, rhs } => {
            let lhs = eval_expr(lhs, ctx);
            let rhs = eval_expr(rhs, ctx);
            EvalValue::Json(Json::Bool(compare(*op, &lhs, &rhs)))
        }
    }
}

/// Parse and evaluate a condition string (bare expression, no braces
/// required; a full `{{...}}` wrapper is tolerated). Truthiness per
/// [`EvalValue::is_truthy`].
pub fn eval_condition(source: &str, ctx: &EvalContext) -> Result<bool> {
    let trimmed = source.trim();
    let inner = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed);
    let expr = parse_expr(inner)?;
    Ok(eval_expr(&expr, ctx).is_truthy())
}

/// Render a template to a string, splicing expression results into the
/// literal text.
pub fn render(source: &str, ctx: &EvalContext) -> Result<String> {
    let template = parse_template(source)?;
    let mut out = String::new();
    for part in &template.parts {
        match part {
            TemplatePart::Text(text) => out.push_str(text),
            TemplatePart::Expr(expr) => out.push_str(&eval_expr(expr, ctx).render()),
        }
    }
    Ok(out)
}

/// Render a template preserving JSON types: a template that is exactly one
/// expression yields that expression's value; anything else falls back to
/// string rendering. Used for output capture and sub-process input mapping.
pub fn render_value(source: &str, ctx: &EvalContext) -> Result<Json> {
    let template = parse_template(source)?;
    if let [TemplatePart::Expr(expr)] = template.parts.as_slice() {
        return Ok(eval_expr(expr, ctx).into_json());
    }
    let mut out = String::new();
    for part in &template.parts {
        match part {
            TemplatePart::Text(text) => out.push_str(text),
            TemplatePart::Expr(expr) => out.push_str(&eval_expr(expr, ctx).render()),
        }
    }
    Ok(Json::String(out))
}

fn resolve_path(segments: &[Segment], ctx: &EvalContext) -> EvalValue {
    let Some((Segment::Key(root), rest)) = segments.split_first() else {
        return EvalValue::Missing;
    };
    match root.as_str() {
        "input" => navigate(ctx.input(), rest),
        "trigger" => navigate(ctx.trigger(), rest),
        "steps" => {
            let Some((Segment::Key(step_id), rest)) = rest.split_first() else {
                return EvalValue::Missing;
            };
            let Some(snapshot) = ctx.step(step_id) else {
                return EvalValue::Missing;
            };
            let Some((Segment::Key(field), rest)) = rest.split_first() else {
                return EvalValue::Missing;
            };
            if field == "output" && !rest.is_empty() {
                // Dotted access into the output goes through the cached
                // structured view; non-JSON string outputs yield missing.
                return snapshot
                    .structured_output()
                    .map_or(EvalValue::Missing, |v| navigate(v, rest));
            }
            snapshot
                .field(field)
                .map_or(EvalValue::Missing, |v| navigate(&v, rest))
        }
        _ => EvalValue::Missing,
    }
}

fn navigate(value: &Json, segments: &[Segment]) -> EvalValue {
    let mut current = value;
    for segment in segments {
        match (segment, current) {
            (Segment::Key(key), Json::Object(map)) => match map.get(key) {
                Some(next) => current = next,
                None => return EvalValue::Missing,
            },
            (Segment::Index(index), Json::Array(items)) => match items.get(*index) {
                Some(next) => current = next,
                None => return EvalValue::Missing,
            },
            _ => return EvalValue::Missing,
        }
    }
    EvalValue::Json(current.clone())
}

fn compare(op: CompareOp, lhs: &EvalValue, rhs: &EvalValue) -> bool {
    match op {
        CompareOp::Eq => values_equal(lhs, rhs),
        CompareOp::Ne => !values_equal(lhs, rhs),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            // Missing fails ordered comparisons outright.
            if lhs.is_missing() || rhs.is_missing() {
                return false;
            }
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                return ordered(op, a.partial_cmp(&b));
            }
            if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
                return ordered(op, Some(a.cmp(b)));
            }
            false
        }
        CompareOp::Contains => match (lhs, rhs) {
            (EvalValue::Json(Json::String(haystack)), needle) => needle
                .as_str()
                .is_some_and(|needle| haystack.contains(needle)),
            (EvalValue::Json(Json::Array(items)), EvalValue::Json(needle)) => {
                items.contains(needle)
            }
            _ => false,
        },
    }
}

fn ordered(op: CompareOp, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        CompareOp::Gt => ordering == Greater,
        CompareOp::Ge => matches!(ordering, Greater | Equal),
        CompareOp::Lt => ordering == Less,
        CompareOp::Le => matches!(ordering, Less | Equal),
        _ => false,
    }
}

fn values_equal(lhs: &EvalValue, rhs: &EvalValue) -> bool {
    // Missing compares unequal to everything, itself included.
    if lhs.is_missing() || rhs.is_missing() {
        return false;
    }
    // Numeric equality bridges numbers and numeric strings.
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return (a - b).abs() < f64::EPSILON;
    }
    match (lhs, rhs) {
        (EvalValue::Json(a), EvalValue::Json(b)) => a == b,
        _ => false,
    }
}
