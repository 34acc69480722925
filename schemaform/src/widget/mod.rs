//! Widget contract.
//!
//! Every widget, leaf or composite, implements [`Widget`]. The engine owns
//! the value store and the instance tree; a widget only sees its node through
//! a [`Binding`] and answers the engine's calls:
//!
//! - `bind` when attached or re-rendered,
//! - `on_change` to normalise user input before it is committed,
//! - `validate` for widget-specific checks on top of the validator,
//! - `reset` when the node is restored,
//! - `on_child_change` when an edit below bubbles through it.

use std::fmt;

use serde_json::Value;

use crate::{error::WidgetError, schema::SchemaNode, validator::Issue};

/// Built-in widget implementations.
pub mod builtin;

/// Semantic type a widget is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WidgetKind {
    Null,
    Boolean,
    String,
    Number,
    Integer,
    Enum,
    Object,
    Array,
    /// Unconstrained values (`true` / `{}` schemas).
    Any,
}

impl WidgetKind {
    /// Object and array widgets own child instances.
    pub fn is_composite(self) -> bool {
        matches!(self, WidgetKind::Object | WidgetKind::Array)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WidgetKind::Null => "null",
            WidgetKind::Boolean => "boolean",
            WidgetKind::String => "string",
            WidgetKind::Number => "number",
            WidgetKind::Integer => "integer",
            WidgetKind::Enum => "enum",
            WidgetKind::Object => "object",
            WidgetKind::Array => "array",
            WidgetKind::Any => "any",
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A widget's view of the node it is attached to.
#[derive(Debug, Clone, Copy)]
pub struct Binding<'a> {
    /// JSON pointer of the node in the value.
    pub path: &'a str,
    /// Effective schema (the active branch for alternatives).
    pub schema: &'a SchemaNode,
    /// Current value, `None` when absent.
    pub value: Option<&'a Value>,
    /// Value to show while absent (schema default).
    pub placeholder: Option<&'a Value>,
    pub required: bool,
    pub dirty: bool,
    pub touched: bool,
}

impl Binding<'_> {
    /// Current value, falling back to the placeholder.
    pub fn shown(&self) -> Option<&Value> {
        self.value.or(self.placeholder)
    }

    /// Display label: title, else the last path segment.
    pub fn label(&self) -> &str {
        match &self.schema.title {
            Some(title) => title,
            None => self.path.rsplit('/').next().unwrap_or(""),
        }
    }
}

/// Capability set every widget implements.
pub trait Widget {
    /// Short identifier, used in rendering and logs.
    fn name(&self) -> &'static str;

    /// Attach to (or re-render from) the bound node.
    fn bind(&mut self, binding: &Binding<'_>);

    /// Normalises raw user input into the value to commit.
    ///
    /// # Errors
    ///
    /// A rejected input is recorded as a validation error on the node; the
    /// stored value stays unchanged.
    fn on_change(&mut self, binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        let _ = binding;
        Ok(input)
    }

    /// Widget-specific checks, run after the validator.
    fn validate(&self, binding: &Binding<'_>) -> Result<Vec<Issue>, WidgetError> {
        let _ = binding;
        Ok(Vec::new())
    }

    /// Drops locally buffered state ahead of a re-bind.
    fn reset(&mut self) {}

    /// Notification that a descendant at `path` committed an edit.
    fn on_child_change(&mut self, path: &str) {
        let _ = path;
    }

    /// Called before the widget is discarded.
    fn unbind(&mut self) {}

    /// One-line textual rendering of the current state.
    fn render(&self) -> String;
}
