//! ABOUTME: Purpose-built template expression language for Trinity process definitions
//! ABOUTME: Parses and evaluates `{{...}}` templates against execution context, totally and without side effects
//!
//! The language is deliberately small: dotted paths with integer indices,
//! a `| default:` filter, and comparison operators for condition contexts.
//! Missing data never fails evaluation; only unparseable syntax does.

pub mod ast;
pub mod context;
pub mod eval;
pub mod parser;
pub mod value;

pub use ast::{CompareOp, Expr, Segment, Template, TemplatePart};
pub use context::{EvalContext, StepSnapshot};
pub use eval::{eval_condition, eval_expr, render, render_value};
pub use parser::{parse_expr, parse_template};
pub use value::EvalValue;

use thiserror::Error;

/// Raised only for unparseable expression syntax. Missing data is not an
/// error; it resolves to [`EvalValue::Missing`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("expression error at offset {offset}: {message}")]
pub struct ExpressionError {
    /// Byte offset into the source expression where parsing stopped.
    pub offset: usize,
    /// Human-readable description of the syntax problem.
    pub message: String,
}

impl ExpressionError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Convenience result alias for expression operations.
pub type Result<T> = std::result::Result<T, ExpressionError>;
