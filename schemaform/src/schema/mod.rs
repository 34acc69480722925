//! Normalized JSON Schema model.
//!
//! A raw schema document is parsed once into a [`Schema`]: an arena of
//! [`SchemaNode`]s addressed by [`SchemaId`]. `$ref` targets are parsed a
//! single time and shared by identity, so recursive schemas form a graph with
//! back-edges instead of an endless unrolled tree.
//!
//! ## Submodules
//!
//! - `parse` - document to arena conversion and reference resolution
//! - `merge` - structural merge of `allOf` branches

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::{error::SchemaError, widget::WidgetKind};

mod merge;
mod parse;

pub(crate) use parse::escape as escape_pointer;

/// Stable identity of a node inside a [`Schema`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(pub(crate) usize);

/// Semantic shape of a schema node. Exactly one per node.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    Null,
    Boolean,
    String,
    Number,
    Integer,
    /// `enum` (or `const`, as a single variant).
    Enum { variants: Vec<Value> },
    /// Properties keep declaration order.
    Object {
        properties: Vec<(String, SchemaId)>,
        required: BTreeSet<String>,
    },
    Array { items: SchemaId },
    OneOf(Vec<SchemaId>),
    AnyOf(Vec<SchemaId>),
    /// Resolved through the synthetic merged node, see [`Schema::deref`].
    AllOf(Vec<SchemaId>),
    Ref { target: SchemaId, reference: String },
    /// The `true` / `{}` schema: accepts anything.
    Any,
}

impl SchemaKind {
    /// Whether this node picks one of several alternatives per value.
    pub fn is_alternative(&self) -> bool {
        matches!(self, SchemaKind::OneOf(_) | SchemaKind::AnyOf(_))
    }

    /// Widget family for a concrete (non-combinator, non-reference) node.
    pub fn widget_kind(&self) -> Option<WidgetKind> {
        Some(match self {
            SchemaKind::Null => WidgetKind::Null,
            SchemaKind::Boolean => WidgetKind::Boolean,
            SchemaKind::String => WidgetKind::String,
            SchemaKind::Number => WidgetKind::Number,
            SchemaKind::Integer => WidgetKind::Integer,
            SchemaKind::Enum { .. } => WidgetKind::Enum,
            SchemaKind::Object { .. } => WidgetKind::Object,
            SchemaKind::Array { .. } => WidgetKind::Array,
            SchemaKind::Any => WidgetKind::Any,
            SchemaKind::OneOf(_)
            | SchemaKind::AnyOf(_)
            | SchemaKind::AllOf(_)
            | SchemaKind::Ref { .. } => return None,
        })
    }

    /// Checks the JSON type of `value` against this node (no constraints).
    pub fn accepts_type(&self, value: &Value) -> bool {
        match self {
            SchemaKind::Null => value.is_null(),
            SchemaKind::Boolean => value.is_boolean(),
            SchemaKind::String => value.is_string(),
            SchemaKind::Number => value.is_number(),
            SchemaKind::Integer => is_integer(value),
            SchemaKind::Enum { variants } => variants.contains(value),
            SchemaKind::Object { .. } => value.is_object(),
            SchemaKind::Array { .. } => value.is_array(),
            SchemaKind::Any => true,
            SchemaKind::OneOf(_)
            | SchemaKind::AnyOf(_)
            | SchemaKind::AllOf(_)
            | SchemaKind::Ref { .. } => true,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            SchemaKind::Null => "null",
            SchemaKind::Boolean => "boolean",
            SchemaKind::String => "string",
            SchemaKind::Number => "number",
            SchemaKind::Integer => "integer",
            SchemaKind::Enum { .. } => "enum",
            SchemaKind::Object { .. } => "object",
            SchemaKind::Array { .. } => "array",
            SchemaKind::OneOf(_) => "oneOf",
            SchemaKind::AnyOf(_) => "anyOf",
            SchemaKind::AllOf(_) => "allOf",
            SchemaKind::Ref { .. } => "$ref",
            SchemaKind::Any => "any",
        }
    }
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One normalized schema location.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    /// Location in the source document (`#/properties/a`).
    pub pointer: String,
    pub kind: SchemaKind,
    pub title: Option<String>,
    pub description: Option<String>,
    pub default: Option<Value>,
    /// Leaf constraint keywords, passed opaquely to the validator.
    pub constraints: Map<String, Value>,
}

impl SchemaNode {
    pub(crate) fn new(pointer: impl Into<String>, kind: SchemaKind) -> Self {
        Self {
            pointer: pointer.into(),
            kind,
            title: None,
            description: None,
            default: None,
            constraints: Map::new(),
        }
    }

    /// Property schema by name, for object nodes.
    pub fn property(&self, name: &str) -> Option<SchemaId> {
        match &self.kind {
            SchemaKind::Object { properties, .. } => properties
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, id)| *id),
            _ => None,
        }
    }

    pub fn is_required(&self, name: &str) -> bool {
        match &self.kind {
            SchemaKind::Object { required, .. } => required.contains(name),
            _ => false,
        }
    }
}

/// Immutable arena of schema nodes built from one document.
#[derive(Debug, Clone)]
pub struct Schema {
    nodes: Vec<SchemaNode>,
    root: SchemaId,
    merged: HashMap<SchemaId, SchemaId>,
}

impl Schema {
    /// Parses and normalizes a raw schema document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for missing `$ref` targets, absent or unknown
    /// `type`, inconsistent shape keywords, non-productive reference cycles
    /// and `allOf` branches that cannot be merged.
    pub fn parse(document: &Value) -> Result<Self, SchemaError> {
        let (nodes, root) = parse::Parser::new(document).run()?;
        let mut schema = Schema {
            nodes,
            root,
            merged: HashMap::new(),
        };
        schema.check_cycles()?;
        merge::merge_all(&mut schema)?;
        debug!(
            "parsed schema: {} nodes, {} merged allOf",
            schema.nodes.len(),
            schema.merged.len()
        );
        Ok(schema)
    }

    pub fn root(&self) -> SchemaId {
        self.root
    }

    pub fn node(&self, id: SchemaId) -> &SchemaNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: SchemaId) -> Option<&SchemaNode> {
        self.nodes.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Follows `$ref` links and `allOf` merges until a node that is either
    /// concrete or a value-dependent alternative (`oneOf`/`anyOf`).
    pub fn deref(&self, mut id: SchemaId) -> SchemaId {
        // Cycles through references alone are rejected at parse time.
        loop {
            match &self.node(id).kind {
                SchemaKind::Ref { target, .. } => id = *target,
                SchemaKind::AllOf(_) => match self.merged.get(&id) {
                    Some(merged) => id = *merged,
                    None => return id,
                },
                _ => return id,
            }
        }
    }

    /// Default for a node, following references: the explicit `default`
    /// nearest to `id` wins.
    pub fn default_of(&self, mut id: SchemaId) -> Option<&Value> {
        loop {
            let node = self.node(id);
            if let Some(default) = &node.default {
                return Some(default);
            }
            match &node.kind {
                SchemaKind::Ref { target, .. } => id = *target,
                SchemaKind::AllOf(_) => id = *self.merged.get(&id)?,
                _ => return None,
            }
        }
    }

    /// Value used for a freshly created element: the schema default, else
    /// the empty value of the node's type.
    pub fn seed_value(&self, id: SchemaId) -> Value {
        if let Some(default) = self.default_of(id) {
            return default.clone();
        }
        let id = self.deref(id);
        match &self.node(id).kind {
            SchemaKind::Boolean => Value::Bool(false),
            SchemaKind::String => Value::String(String::new()),
            SchemaKind::Number | SchemaKind::Integer => Value::from(0),
            SchemaKind::Enum { variants } => variants.first().cloned().unwrap_or(Value::Null),
            SchemaKind::Object { .. } => Value::Object(Map::new()),
            SchemaKind::Array { .. } => Value::Array(Vec::new()),
            SchemaKind::OneOf(branches) | SchemaKind::AnyOf(branches) => branches
                .first()
                .map(|b| self.seed_value(*b))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Rejects cycles made only of `$ref` and combinator edges: those could
    /// never reach a concrete widget type.
    fn check_cycles(&self) -> Result<(), SchemaError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(schema: &Schema, id: SchemaId, marks: &mut [Mark]) -> Result<(), SchemaError> {
            match marks[id.0] {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    return Err(SchemaError::RefCycle {
                        path: schema.node(id).pointer.clone(),
                    });
                }
                Mark::New => {}
            }
            marks[id.0] = Mark::Active;
            match &schema.node(id).kind {
                SchemaKind::Ref { target, .. } => visit(schema, *target, marks)?,
                SchemaKind::OneOf(branches)
                | SchemaKind::AnyOf(branches)
                | SchemaKind::AllOf(branches) => {
                    for branch in branches {
                        visit(schema, *branch, marks)?;
                    }
                }
                _ => {}
            }
            marks[id.0] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        for idx in 0..self.nodes.len() {
            visit(self, SchemaId(idx), &mut marks)?;
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, node: SchemaNode) -> SchemaId {
        self.nodes.push(node);
        SchemaId(self.nodes.len() - 1)
    }
}

pub(crate) fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => false,
    }
}

/// JSON type name of a value, for messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_object_keeps_property_order() {
        let schema = Schema::parse(&json!({
            "type": "object",
            "properties": {
                "zeta": {"type": "string"},
                "alpha": {"type": "integer"},
                "mid": {"type": "boolean"}
            },
            "required": ["alpha"]
        }))
        .unwrap();

        let root = schema.node(schema.root());
        let SchemaKind::Object {
            properties,
            required,
        } = &root.kind
        else {
            panic!("expected object, got {}", root.kind);
        };
        let names: Vec<_> = properties.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        assert!(required.contains("alpha"));
        assert!(root.is_required("alpha"));
        assert!(!root.is_required("zeta"));
    }

    #[test]
    fn test_ref_is_shared_by_identity() {
        let schema = Schema::parse(&json!({
            "type": "object",
            "properties": {
                "a": {"$ref": "#/$defs/point"},
                "b": {"$ref": "#/$defs/point"}
            },
            "$defs": {
                "point": {"type": "object", "properties": {"x": {"type": "number"}}}
            }
        }))
        .unwrap();

        let root = schema.node(schema.root());
        let a = schema.deref(root.property("a").unwrap());
        let b = schema.deref(root.property("b").unwrap());
        assert_eq!(a, b);
        assert_eq!(schema.node(a).pointer, "#/$defs/point");
    }

    #[test]
    fn test_recursive_ref_terminates() {
        let schema = Schema::parse(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "child": {"$ref": "#"}
            }
        }))
        .unwrap();
        let root = schema.node(schema.root());
        let child = root.property("child").unwrap();
        assert_eq!(schema.deref(child), schema.root());
    }

    #[test]
    fn test_missing_ref_fails() {
        let err = Schema::parse(&json!({"$ref": "#/$defs/missing"})).unwrap_err();
        assert!(matches!(err, SchemaError::MissingRef { .. }));
    }

    #[test]
    fn test_missing_and_unknown_type() {
        let err = Schema::parse(&json!({"minLength": 3})).unwrap_err();
        assert_eq!(err, SchemaError::MissingType { path: "#".into() });

        let err = Schema::parse(&json!({"type": "text"})).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType { ty, .. } if ty == "text"));
    }

    #[test]
    fn test_items_on_non_array_is_inconsistent() {
        let err = Schema::parse(&json!({
            "type": "string",
            "items": {"type": "string"}
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::Inconsistent { .. }));

        let err = Schema::parse(&json!({
            "oneOf": [{"type": "string"}],
            "properties": {"a": {"type": "string"}}
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::Inconsistent { .. }));
    }

    #[test]
    fn test_non_productive_cycle_rejected() {
        let err = Schema::parse(&json!({
            "$ref": "#/$defs/a",
            "$defs": {
                "a": {"$ref": "#/$defs/b"},
                "b": {"oneOf": [{"$ref": "#/$defs/a"}, {"type": "null"}]}
            }
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::RefCycle { .. }));
    }

    #[test]
    fn test_nullable_type_list_becomes_any_of() {
        let schema = Schema::parse(&json!({
            "type": ["array", "null"],
            "items": {"type": "string"}
        }))
        .unwrap();
        let root = schema.node(schema.root());
        let SchemaKind::AnyOf(branches) = &root.kind else {
            panic!("expected anyOf, got {}", root.kind);
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(
            schema.node(branches[0]).kind,
            SchemaKind::Array { .. }
        ));
        assert_eq!(schema.node(branches[1]).kind, SchemaKind::Null);
    }

    #[test]
    fn test_const_and_constraints() {
        let schema = Schema::parse(&json!({
            "type": "string",
            "const": "fixed",
            "title": "Fixed"
        }))
        .unwrap();
        let root = schema.node(schema.root());
        assert_eq!(
            root.kind,
            SchemaKind::Enum {
                variants: vec![json!("fixed")]
            }
        );
        assert_eq!(root.title.as_deref(), Some("Fixed"));

        let schema = Schema::parse(&json!({"type": "string", "minLength": 3})).unwrap();
        let root = schema.node(schema.root());
        assert_eq!(root.constraints.get("minLength"), Some(&json!(3)));
        assert!(!root.constraints.contains_key("type"));
    }

    #[test]
    fn test_seed_value() {
        let schema = Schema::parse(&json!({
            "type": "array",
            "items": {"type": "object", "properties": {"on": {"type": "boolean", "default": true}}}
        }))
        .unwrap();
        let SchemaKind::Array { items } = schema.node(schema.root()).kind else {
            panic!("expected array");
        };
        assert_eq!(schema.seed_value(items), json!({}));
        assert_eq!(schema.seed_value(schema.root()), json!([]));
    }

    #[test]
    fn test_integer_accepts_whole_floats() {
        assert!(SchemaKind::Integer.accepts_type(&json!(3)));
        assert!(SchemaKind::Integer.accepts_type(&json!(3.0)));
        assert!(!SchemaKind::Integer.accepts_type(&json!(3.5)));
        assert!(SchemaKind::Number.accepts_type(&json!(3.5)));
    }
}
