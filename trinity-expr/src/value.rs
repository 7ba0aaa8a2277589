//! ABOUTME: Evaluation value model distinguishing missing data from JSON null

use serde_json::Value as Json;

/// Result of evaluating an expression. `Missing` is distinct from JSON
/// `null`: a reference that does not resolve at all is missing, a field the
/// data actually carries as null is null. Gateways depend on the difference.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    /// The reference did not resolve to any value.
    Missing,
    /// A concrete JSON value (possibly `null`).
    Json(Json),
}

impl EvalValue {
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Missing, null, or the empty string. This is the emptiness the
    /// `default:` filter falls back on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Json(Json::Null) => true,
            Self::Json(Json::String(s)) => s.is_empty(),
            Self::Json(_) => false,
        }
    }

    /// Numeric view, accepting JSON numbers and numeric strings.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Json(Json::Number(n)) => n.as_f64(),
            Self::Json(Json::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(Json::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Truthiness for bare-path conditions: false for missing, null,
    /// `false`, empty string, and zero; true otherwise.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Missing => false,
            Self::Json(Json::Null) => false,
            Self::Json(Json::Bool(b)) => *b,
            Self::Json(Json::String(s)) => !s.is_empty(),
            Self::Json(Json::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Self::Json(Json::Array(_) | Json::Object(_)) => true,
        }
    }

    /// String rendering for interpolation. Missing and null render empty;
    /// strings render bare; everything else renders as compact JSON.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Missing | Self::Json(Json::Null) => String::new(),
            Self::Json(Json::String(s)) => s.clone(),
            Self::Json(Json::Bool(b)) => b.to_string(),
            Self::Json(Json::Number(n)) => n.to_string(),
            Self::Json(other) => other.to_string(),
        }
    }

    /// JSON view for typed capture; missing becomes null.
    #[must_use]
    pub fn into_json(self) -> Json {
        match self {
            Self::Missing => Json::Null,
            Self::Json(v) => v,
        }
    }
}

impl From<Json> for EvalValue {
    fn from(value: Json) -> Self {
        Self::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_and_null_are_distinct() {
        assert_ne!(EvalValue::Missing, EvalValue::Json(Json::Null));
        assert!(EvalValue::Missing.is_empty());
        assert!(EvalValue::Json(Json::Null).is_empty());
    }

    #[test]
    fn empty_string_counts_as_empty() {
        assert!(EvalValue::Json(json!("")).is_empty());
        assert!(!EvalValue::Json(json!("x")).is_empty());
    }

    #[test]
    fn numeric_strings_coerce() {
        assert_eq!(EvalValue::Json(json!("85")).as_f64(), Some(85.0));
        assert_eq!(EvalValue::Json(json!(85)).as_f64(), Some(85.0));
        assert_eq!(EvalValue::Json(json!("nope")).as_f64(), None);
    }

    #[test]
    fn missing_renders_empty() {
        assert_eq!(EvalValue::Missing.render(), "");
        assert_eq!(EvalValue::Json(json!("hi")).render(), "hi");
        assert_eq!(EvalValue::Json(json!([1, 2])).render(), "[1,2]");
    }
}
