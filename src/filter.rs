//! # Topic Predicates
//!
//! Server-side narrowing predicates attached to subscriptions and
//! range queries. The textual form is `field=op.value`, for example
//! `status=eq.OPEN` or `tipo=in.(ORDINARIA,EXTRA)`. The same predicate
//! is re-checked locally against incoming record bodies so a shared
//! channel never leaks rows a narrower caller did not ask for.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineError, EngineResult};

/// Filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Equals
    #[serde(rename = "eq")]
    Eq,

    /// Not equals
    #[serde(rename = "neq")]
    Neq,

    /// Greater than
    #[serde(rename = "gt")]
    Gt,

    /// Greater than or equal
    #[serde(rename = "gte")]
    Gte,

    /// Less than
    #[serde(rename = "lt")]
    Lt,

    /// Less than or equal
    #[serde(rename = "lte")]
    Lte,

    /// Value in list
    #[serde(rename = "in")]
    In,
}

impl FilterOperator {
    /// Get the operator string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(FilterOperator::Eq),
            "neq" => Some(FilterOperator::Neq),
            "gt" => Some(FilterOperator::Gt),
            "gte" => Some(FilterOperator::Gte),
            "lt" => Some(FilterOperator::Lt),
            "lte" => Some(FilterOperator::Lte),
            "in" => Some(FilterOperator::In),
            _ => None,
        }
    }
}

/// A parsed predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,

    /// Comparison operator
    pub operator: FilterOperator,

    /// Value to compare against
    pub value: Value,
}

impl FilterExpr {
    /// Create a new predicate
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality predicate
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create an "in list" predicate
    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    /// Parse the textual form `field=op.value`
    pub fn parse(text: &str) -> EngineResult<Self> {
        let (field, rest) = text
            .split_once('=')
            .ok_or_else(|| EngineError::InvalidFilter(format!("missing '=' in {text:?}")))?;
        let (op, raw) = rest
            .split_once('.')
            .ok_or_else(|| EngineError::InvalidFilter(format!("missing operator in {text:?}")))?;

        if field.is_empty() {
            return Err(EngineError::InvalidFilter(format!(
                "empty field in {text:?}"
            )));
        }

        let operator = FilterOperator::parse(op)
            .ok_or_else(|| EngineError::InvalidFilter(format!("unknown operator {op:?}")))?;

        let value = match operator {
            FilterOperator::In => {
                let inner = raw
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| {
                        EngineError::InvalidFilter(format!("in-list must be parenthesized: {raw:?}"))
                    })?;
                Value::Array(inner.split(',').map(|s| parse_scalar(s.trim())).collect())
            }
            _ => parse_scalar(raw),
        };

        Ok(Self::new(field, operator, value))
    }

    /// Render back to the canonical textual form
    pub fn canonical(&self) -> String {
        format!(
            "{}={}.{}",
            self.field,
            self.operator.as_str(),
            render_value(&self.value)
        )
    }

    /// Render as a query-string pair, e.g. `("status", "eq.OPEN")`
    pub fn query_pair(&self) -> (String, String) {
        (
            self.field.clone(),
            format!("{}.{}", self.operator.as_str(), render_value(&self.value)),
        )
    }

    /// Check if a record body matches this predicate
    pub fn matches(&self, record: &Value) -> bool {
        let field_value = match record.get(&self.field) {
            Some(v) => v,
            None => return false,
        };

        match self.operator {
            FilterOperator::Eq => field_value == &self.value,
            FilterOperator::Neq => field_value != &self.value,
            FilterOperator::Gt => compare_json_values(field_value, &self.value) > 0,
            FilterOperator::Gte => compare_json_values(field_value, &self.value) >= 0,
            FilterOperator::Lt => compare_json_values(field_value, &self.value) < 0,
            FilterOperator::Lte => compare_json_values(field_value, &self.value) <= 0,
            FilterOperator::In => {
                if let Some(arr) = self.value.as_array() {
                    arr.contains(field_value)
                } else {
                    false
                }
            }
        }
    }
}

/// Parse a scalar predicate value: numbers, booleans and null take
/// their JSON meaning, everything else stays a bare string.
fn parse_scalar(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                Value::Number(n.into())
            } else if let Ok(f) = raw.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(raw.to_string()))
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

/// Render a predicate value in textual form (strings stay bare)
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(render_value).collect();
            format!("({})", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Compare two JSON values for ordering
fn compare_json_values(a: &Value, b: &Value) -> i32 {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let a_f = a.as_f64().unwrap_or(0.0);
            let b_f = b.as_f64().unwrap_or(0.0);
            if a_f < b_f {
                -1
            } else if a_f > b_f {
                1
            } else {
                0
            }
        }
        (Value::String(a), Value::String(b)) => a.cmp(b) as i32,
        _ => 0,
    }
}
