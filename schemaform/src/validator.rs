//! Validation collaborator boundary.
//!
//! The engine never evaluates constraint keywords itself. It hands a node's
//! constraint bag and the current value to a [`Validator`], synchronously via
//! [`Validator::check`] and, for remote or slow checks, asynchronously via
//! [`Validator::check_async`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use regex::Regex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::schema::{SchemaKind, SchemaNode};

/// One problem found on a node, without location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Machine-readable code, usually the failing keyword.
    pub code: String,
    pub message: String,
}

impl Issue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Receiver for an asynchronous check result.
pub type PendingCheck = oneshot::Receiver<Vec<Issue>>;

/// Keywords a composite satisfies through its member count and key set
/// alone. Edits below the composite that keep every member present leave
/// their outcome unchanged.
pub(crate) const SHAPE_KEYWORDS: &[&str] = &[
    "minProperties",
    "maxProperties",
    "additionalProperties",
    "minItems",
    "maxItems",
];

/// Constraint checker consulted for every present value.
pub trait Validator: Send + Sync {
    /// Checks `value` against the node's direct constraints only; children
    /// of composite values are checked through their own nodes.
    fn check(&self, schema: &SchemaNode, value: &Value) -> Vec<Issue>;

    /// Starts an asynchronous check. The node stays pending (and the form
    /// invalid) until the receiver yields.
    fn check_async(&self, schema: &SchemaNode, value: &Value) -> Option<PendingCheck> {
        let _ = (schema, value);
        None
    }
}

impl<V: Validator + ?Sized> Validator for Arc<V> {
    fn check(&self, schema: &SchemaNode, value: &Value) -> Vec<Issue> {
        (**self).check(schema, value)
    }

    fn check_async(&self, schema: &SchemaNode, value: &Value) -> Option<PendingCheck> {
        (**self).check_async(schema, value)
    }
}

/// Synchronous checker for the common length, range, count and pattern
/// keywords. Unknown keywords are ignored.
#[derive(Debug, Default)]
pub struct BasicValidator {
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl BasicValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pattern_matches(&self, pattern: &str, text: &str) -> Option<bool> {
        let mut cache = match self.patterns.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        let regex = cache.entry(pattern.to_string()).or_insert_with(|| {
            Regex::new(pattern)
                .map_err(|e| warn!("ignoring invalid pattern `{pattern}`: {e}"))
                .ok()
        });
        regex.as_ref().map(|re| re.is_match(text))
    }

    fn check_string(&self, node: &SchemaNode, s: &str, issues: &mut Vec<Issue>) {
        let len = s.chars().count() as f64;
        if let Some(min) = number(node, "minLength")
            && len < min
        {
            issues.push(Issue::new(
                "minLength",
                format!("must be at least {min} characters"),
            ));
        }
        if let Some(max) = number(node, "maxLength")
            && len > max
        {
            issues.push(Issue::new(
                "maxLength",
                format!("must be at most {max} characters"),
            ));
        }
        if let Some(Value::String(pattern)) = node.constraints.get("pattern")
            && self.pattern_matches(pattern, s) == Some(false)
        {
            issues.push(Issue::new("pattern", format!("must match `{pattern}`")));
        }
    }
}

fn number(node: &SchemaNode, keyword: &str) -> Option<f64> {
    node.constraints.get(keyword).and_then(Value::as_f64)
}

fn check_number(node: &SchemaNode, n: f64, issues: &mut Vec<Issue>) {
    // Draft 4 spells exclusive bounds as booleans next to minimum/maximum.
    let flag = |k: &str| node.constraints.get(k).and_then(Value::as_bool) == Some(true);
    if let Some(min) = number(node, "minimum") {
        if flag("exclusiveMinimum") {
            if n <= min {
                issues.push(Issue::new("exclusiveMinimum", format!("must be > {min}")));
            }
        } else if n < min {
            issues.push(Issue::new("minimum", format!("must be >= {min}")));
        }
    }
    if let Some(max) = number(node, "maximum") {
        if flag("exclusiveMaximum") {
            if n >= max {
                issues.push(Issue::new("exclusiveMaximum", format!("must be < {max}")));
            }
        } else if n > max {
            issues.push(Issue::new("maximum", format!("must be <= {max}")));
        }
    }
    if let Some(min) = number(node, "exclusiveMinimum")
        && n <= min
    {
        issues.push(Issue::new("exclusiveMinimum", format!("must be > {min}")));
    }
    if let Some(max) = number(node, "exclusiveMaximum")
        && n >= max
    {
        issues.push(Issue::new("exclusiveMaximum", format!("must be < {max}")));
    }
    if let Some(step) = number(node, "multipleOf")
        && step > 0.0
    {
        let ratio = n / step;
        if (ratio - ratio.round()).abs() > 1e-9 {
            issues.push(Issue::new("multipleOf", format!("must be a multiple of {step}")));
        }
    }
}

fn check_array(node: &SchemaNode, items: &[Value], issues: &mut Vec<Issue>) {
    let len = items.len() as f64;
    if let Some(min) = number(node, "minItems")
        && len < min
    {
        issues.push(Issue::new("minItems", format!("must have at least {min} items")));
    }
    if let Some(max) = number(node, "maxItems")
        && len > max
    {
        issues.push(Issue::new("maxItems", format!("must have at most {max} items")));
    }
    if node.constraints.get("uniqueItems") == Some(&Value::Bool(true)) {
        let duplicate = items
            .iter()
            .enumerate()
            .any(|(i, a)| items[i + 1..].contains(a));
        if duplicate {
            issues.push(Issue::new("uniqueItems", "items must be unique"));
        }
    }
}

fn check_object(node: &SchemaNode, map: &serde_json::Map<String, Value>, issues: &mut Vec<Issue>) {
    let len = map.len() as f64;
    if let Some(min) = number(node, "minProperties")
        && len < min
    {
        issues.push(Issue::new(
            "minProperties",
            format!("must have at least {min} properties"),
        ));
    }
    if let Some(max) = number(node, "maxProperties")
        && len > max
    {
        issues.push(Issue::new(
            "maxProperties",
            format!("must have at most {max} properties"),
        ));
    }
    if node.constraints.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in map.keys() {
            if node.property(key).is_none() {
                issues.push(Issue::new(
                    "additionalProperties",
                    format!("unexpected property `{key}`"),
                ));
            }
        }
    }
}

impl Validator for BasicValidator {
    fn check(&self, schema: &SchemaNode, value: &Value) -> Vec<Issue> {
        let mut issues = Vec::new();
        match value {
            Value::String(s) => self.check_string(schema, s, &mut issues),
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    check_number(schema, n, &mut issues);
                }
            }
            Value::Array(items) => check_array(schema, items, &mut issues),
            Value::Object(map) if matches!(schema.kind, SchemaKind::Object { .. } | SchemaKind::Any) => {
                check_object(schema, map, &mut issues)
            }
            _ => {}
        }
        issues
    }
}
