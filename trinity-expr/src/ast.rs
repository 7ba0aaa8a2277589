//! ABOUTME: AST for the template expression language
//! ABOUTME: Templates are alternating literal text and embedded expressions

/// One parsed `{{ ... }}` expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted/bracketed access path rooted at an identifier,
    /// e.g. `steps.review.output.decision` or `input.items[0].name`.
    Path(Vec<Segment>),
    /// Single-quoted string literal.
    Str(String),
    /// Numeric literal (always carried as f64).
    Num(f64),
    /// `true` / `false`.
    Bool(bool),
    /// `lhs | default:rhs`: rhs when lhs is missing, null, or "".
    Default {
        value: Box<Expr>,
        fallback: Box<Expr>,
    },
    /// Comparison, only meaningful in condition contexts.
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// A single path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// `.name` (or the root identifier).
    Key(String),
    /// `[3]`.
    Index(usize),
}

/// Comparison operators available inside conditions and gateway expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl CompareOp {
    /// Source-level spelling of the operator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Contains => "contains",
        }
    }
}

/// One piece of a parsed template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Literal text copied through verbatim.
    Text(String),
    /// An embedded `{{ ... }}` expression.
    Expr(Expr),
}

/// A fully parsed template: literal text interleaved with expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

impl Template {
    /// True when the template is a single expression with no surrounding
    /// text, in which case evaluation preserves the value's JSON type
    /// instead of stringifying it.
    #[must_use]
    pub fn is_single_expr(&self) -> bool {
        matches!(self.parts.as_slice(), [TemplatePart::Expr(_)])
    }

    /// All access paths referenced anywhere in the template, for
    /// definition-time reference checking.
    #[must_use]
    pub fn referenced_paths(&self) -> Vec<&[Segment]> {
        let mut out = Vec::new();
        for part in &self.parts {
            if let TemplatePart::Expr(expr) = part {
                collect_paths(expr, &mut out);
            }
        }
        out
    }
}

fn collect_paths<'a>(expr: &'a Expr, out: &mut Vec<&'a [Segment]>) {
    match expr {
        Expr::Path(segments) => out.push(segments),
        Expr::Default { value, fallback } => {
            collect_paths(value, out);
            collect_paths(fallback, out);
        }
        Expr::Compare { lhs, rhs, .. } => {
            collect_paths(lhs, out);
            collect_paths(rhs, out);
        }
        Expr::Str(_) | Expr::Num(_) | Expr::Bool(_) => {}
    }
}
