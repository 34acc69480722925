//! # schemaform
//!
//! A headless, JSON Schema driven form engine.
//!
//! Given a JSON Schema document and an optional initial value, schemaform
//! builds a tree of widget instances mirroring the schema, binds each widget
//! to its slice of the value, routes edits back into the value and keeps an
//! up-to-date validation result for the whole form.
//!
//! ## Features
//!
//! - `$ref` resolution by identity, with deferred expansion of recursive schemas
//! - `oneOf`/`anyOf` branch selection from the current value, `allOf` merging
//! - Pluggable widgets through a last-registration-wins [`Registry`]
//! - Sparse binding: absent properties stay absent until first edited
//! - Incremental, bottom-up validation with asynchronous checks
//! - TOML and JSON value documents, forms for `schemars` typed configs
//!
//! ## Quick Start
//!
//! ```rust
//! use schemaform::Form;
//! use serde_json::json;
//!
//! let schema = json!({
//!     "type": "object",
//!     "properties": {"name": {"type": "string", "minLength": 3}},
//!     "required": ["name"]
//! });
//! let mut form = Form::new(&schema, Some(json!({}))).unwrap();
//! assert!(!form.is_valid());
//!
//! form.set("/name", json!("ostool")).unwrap();
//! assert!(form.is_valid());
//! assert_eq!(form.value(), json!({"name": "ostool"}));
//! ```
//!
//! ## Modules
//!
//! - [`schema`] - Schema parsing and normalization
//! - [`registry`] - Widget lookup by semantic type
//! - [`widget`] - Widget contract and stock widgets
//! - [`value`] - Value store with dirty/touched tracking
//! - [`form`] - Render tree, edits and validation aggregation
//! - [`validator`] - Constraint checking collaborator
//! - [`source`] - Loading and saving documents

#[macro_use]
extern crate log;

pub mod error;
pub mod form;
pub mod registry;
pub mod schema;
pub mod source;
pub mod validator;
pub mod value;
pub mod widget;

pub use error::{BindingError, FormError, NoWidgetError, Result, SchemaError, WidgetError};
pub use form::{
    ChangeCause, ChangeEvent, FieldError, Form, FormBuilder, FormOptions, InstanceId,
    ValidationResult,
};
pub use registry::Registry;
pub use serde_json::Value;
pub use validator::{BasicValidator, Issue, Validator};
pub use widget::{Binding, Widget, WidgetKind};
