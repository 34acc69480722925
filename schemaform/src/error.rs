//! Error types for schema loading, widget dispatch and value binding.
//!
//! Only structural failures are Rust errors. Per-node validation problems are
//! reported as [`FieldError`](crate::form::FieldError) entries and never abort
//! rendering.

use thiserror::Error;

use crate::{form::InstanceId, widget::WidgetKind};

/// Result alias used across the crate.
pub type Result<T, E = FormError> = std::result::Result<T, E>;

/// Malformed or unresolvable schema. Fatal: nothing is rendered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// A `$ref` points at a location that does not exist in the document.
    #[error("{path}: unresolved reference `{reference}`")]
    MissingRef { path: String, reference: String },

    /// A node declares no `type` and no combinator, reference or enum.
    #[error("{path}: missing `type`")]
    MissingType { path: String },

    /// `type` names something that is not a JSON Schema type.
    #[error("{path}: unknown type `{ty}`")]
    UnknownType { path: String, ty: String },

    /// A keyword has the wrong JSON shape (e.g. `required` is not a list).
    #[error("{path}: `{keyword}` must be {expected}")]
    InvalidKeyword {
        path: String,
        keyword: String,
        expected: String,
    },

    /// Shape keywords contradict the node's semantic type.
    #[error("{path}: {reason}")]
    Inconsistent { path: String, reason: String },

    /// A reference or combinator loops back to itself without an object or
    /// array in between, so no widget could ever be selected.
    #[error("{path}: reference cycle does not pass through an object or array")]
    RefCycle { path: String },

    /// `allOf` branches cannot be merged into a single node.
    #[error("{path}: cannot merge allOf: {reason}")]
    Unmergeable { path: String, reason: String },
}

/// No widget is registered for a resolved type and no fallback is set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no widget registered for `{kind}`")]
pub struct NoWidgetError {
    pub kind: WidgetKind,
}

/// Structural mismatch between a value and the schema it is bound to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindingError {
    /// The value is not the container the schema expects. Recovered by
    /// coercing to an empty container.
    #[error("{path}: expected {expected}, found {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A value node is already attached to another widget instance.
    #[error("{path}: value already bound to instance {bound:?}")]
    AlreadyBound { path: String, bound: InstanceId },
}

/// Rejection raised by a widget while normalising user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WidgetError {
    pub code: String,
    pub message: String,
}

impl WidgetError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Umbrella error for form operations.
#[derive(Debug, Error)]
pub enum FormError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    NoWidget(#[from] NoWidgetError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    /// The instance id is stale (its subtree was rebuilt or removed).
    #[error("unknown widget instance {0:?}")]
    UnknownInstance(InstanceId),

    /// No instance lives at the given JSON pointer.
    #[error("no widget at `{0}`")]
    UnknownPath(String),

    /// An array operation was requested on a non-array instance.
    #[error("{path}: not an array")]
    NotAnArray { path: String },

    #[error("{path}: index {index} out of range (len {len})")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
