// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tagged value type used for step outputs, template context, and run inputs.
//!
//! The source system passes dynamic dicts around; here every place that
//! would have held an arbitrary dict instead holds a [`Value`], which can be
//! walked structurally (dotted path access) without reflection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A dynamically-typed value flowing through templates, step outputs, and
/// run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Scalar(String),
    Number(f64),
    Bool(bool),
    Json(serde_json::Value),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Walks a dotted path (e.g. `user.name`, `items.0.id`) through this
    /// value. Integer segments index into lists.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        if path.is_empty() {
            return Some(self.clone());
        }
        let mut current = self.clone();
        for segment in path.split('.') {
            current = match &current {
                Value::Json(serde_json::Value::Object(map)) => {
                    map.get(segment).map(|v| Value::from_json(v.clone()))?
                }
                Value::Json(serde_json::Value::Array(arr)) => {
                    let idx: usize = segment.parse().ok()?;
                    arr.get(idx).map(|v| Value::from_json(v.clone()))?
                }
                Value::List(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx).cloned()?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Scalar(s),
            serde_json::Value::Array(arr) => {
                Value::List(arr.into_iter().map(Value::from_json).collect())
            }
            other @ serde_json::Value::Object(_) => Value::Json(other),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Scalar(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::json!(n),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Json(v) => v.clone(),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Renders this value as it would appear substituted into a template: a
    /// bare string stays bare, everything else is JSON-encoded.
    pub fn render(&self) -> String {
        match self {
            Value::Scalar(s) => s.clone(),
            Value::Null => "null".to_string(),
            _ => self.to_json().to_string(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

/// Shorthand for the step-output / input maps threaded through run context.
pub type ValueMap = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_nested_object_path() {
        let v = Value::from_json(serde_json::json!({"user": {"name": "Ada"}}));
        assert_eq!(v.get_path("user.name"), Some(Value::Scalar("Ada".into())));
    }

    #[test]
    fn walks_list_index() {
        let v = Value::from_json(serde_json::json!({"items": [1, 2, 3]}));
        assert_eq!(v.get_path("items.1"), Some(Value::Number(2.0)));
    }

    #[test]
    fn missing_path_is_none() {
        let v = Value::from_json(serde_json::json!({"a": 1}));
        assert_eq!(v.get_path("b.c"), None);
    }

    #[test]
    fn scalar_renders_bare() {
        assert_eq!(Value::Scalar("hi".into()).render(), "hi");
    }
}
