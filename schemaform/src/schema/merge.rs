//! Structural merge of `allOf` branches into one synthetic node.
//!
//! Properties are unioned, `required` is unioned, numeric bounds tighten and
//! any other conflicting constraint is taken from the last branch declaring
//! it.

use serde_json::{Map, Value};

use super::{Schema, SchemaId, SchemaKind, SchemaNode};
use crate::error::SchemaError;

/// Keywords where the larger bound is the tighter one.
const LOWER_BOUNDS: &[&str] = &[
    "minimum",
    "exclusiveMinimum",
    "minLength",
    "minItems",
    "minProperties",
];

/// Keywords where the smaller bound is the tighter one.
const UPPER_BOUNDS: &[&str] = &[
    "maximum",
    "exclusiveMaximum",
    "maxLength",
    "maxItems",
    "maxProperties",
];

pub(super) fn merge_all(schema: &mut Schema) -> Result<(), SchemaError> {
    let all_of: Vec<SchemaId> = (0..schema.len())
        .map(SchemaId)
        .filter(|id| matches!(schema.node(*id).kind, SchemaKind::AllOf(_)))
        .collect();
    for id in all_of {
        merged_of(schema, id)?;
    }
    Ok(())
}

/// Merged node for an `allOf` node, computing nested merges first.
fn merged_of(schema: &mut Schema, id: SchemaId) -> Result<SchemaId, SchemaError> {
    if let Some(merged) = schema.merged.get(&id) {
        return Ok(*merged);
    }
    let SchemaKind::AllOf(branches) = schema.node(id).kind.clone() else {
        return Ok(id);
    };
    let owner = schema.node(id).clone();

    let mut parts = Vec::with_capacity(branches.len());
    for branch in branches {
        parts.push(flatten(schema, branch, &owner.pointer)?);
    }

    let mut merged = SchemaNode::new(owner.pointer.clone(), SchemaKind::Any);
    for part in &parts {
        let part = schema.node(*part).clone();
        merged.kind = match (merged.kind, part.kind) {
            (SchemaKind::Array { items }, SchemaKind::Array { items: more }) => SchemaKind::Array {
                items: merge_items(schema, &owner.pointer, items, more)?,
            },
            (acc, next) => merge_kind(&owner.pointer, acc, next)?,
        };
        merge_constraints(&mut merged.constraints, &part.constraints);
        if part.default.is_some() {
            merged.default = part.default;
        }
        if part.title.is_some() {
            merged.title = part.title;
        }
        if part.description.is_some() {
            merged.description = part.description;
        }
    }
    // The allOf node's own annotations are the last writer.
    merge_constraints(&mut merged.constraints, &owner.constraints);
    merged.title = owner.title.or(merged.title);
    merged.description = owner.description.or(merged.description);
    merged.default = owner.default.or(merged.default);

    let merged_id = schema.push(merged);
    schema.merged.insert(id, merged_id);
    debug!("merged allOf at {} into node {}", owner.pointer, merged_id.0);
    Ok(merged_id)
}

/// Item schema of two merged array branches. An omitted `items` accepts
/// anything and yields to the other side; two declared ones are merged in
/// turn through a synthetic `allOf`.
fn merge_items(
    schema: &mut Schema,
    owner: &str,
    items: SchemaId,
    more: SchemaId,
) -> Result<SchemaId, SchemaError> {
    let (left, right) = (flatten(schema, items, owner)?, flatten(schema, more, owner)?);
    if left == right || is_unconstrained(schema.node(right)) {
        return Ok(items);
    }
    if is_unconstrained(schema.node(left)) {
        return Ok(more);
    }
    let pair = SchemaKind::AllOf(vec![items, more]);
    // Recursive item schemas meet the same pair again while it is merged.
    if let Some(existing) = (0..schema.len())
        .map(SchemaId)
        .find(|id| schema.node(*id).kind == pair)
    {
        return Ok(existing);
    }
    let id = schema.push(SchemaNode::new(format!("{owner}/items"), pair));
    merged_of(schema, id)?;
    Ok(id)
}

fn is_unconstrained(node: &SchemaNode) -> bool {
    node.kind == SchemaKind::Any && node.constraints.is_empty()
}

/// Resolves a branch to a concrete node that can be merged.
fn flatten(schema: &mut Schema, mut id: SchemaId, owner: &str) -> Result<SchemaId, SchemaError> {
    loop {
        match &schema.node(id).kind {
            SchemaKind::Ref { target, .. } => id = *target,
            SchemaKind::AllOf(_) => return merged_of(schema, id),
            SchemaKind::OneOf(_) | SchemaKind::AnyOf(_) => {
                return Err(SchemaError::Unmergeable {
                    path: owner.to_string(),
                    reason: format!(
                        "branch {} is a value-dependent alternative",
                        schema.node(id).pointer
                    ),
                });
            }
            _ => return Ok(id),
        }
    }
}

fn merge_kind(pointer: &str, acc: SchemaKind, next: SchemaKind) -> Result<SchemaKind, SchemaError> {
    let conflict = |a: &SchemaKind, b: &SchemaKind| SchemaError::Unmergeable {
        path: pointer.to_string(),
        reason: format!("`{a}` and `{b}` branches disagree"),
    };
    Ok(match (acc, next) {
        (SchemaKind::Any, other) | (other, SchemaKind::Any) => other,
        (
            SchemaKind::Object {
                mut properties,
                mut required,
            },
            SchemaKind::Object {
                properties: more,
                required: more_required,
            },
        ) => {
            for (name, id) in more {
                match properties.iter_mut().find(|(k, _)| *k == name) {
                    Some(slot) => slot.1 = id,
                    None => properties.push((name, id)),
                }
            }
            required.extend(more_required);
            SchemaKind::Object {
                properties,
                required,
            }
        }
        (SchemaKind::Enum { variants }, SchemaKind::Enum { variants: other }) => {
            let kept: Vec<Value> = variants.into_iter().filter(|v| other.contains(v)).collect();
            if kept.is_empty() {
                return Err(SchemaError::Unmergeable {
                    path: pointer.to_string(),
                    reason: "enum branches share no variant".into(),
                });
            }
            SchemaKind::Enum { variants: kept }
        }
        (SchemaKind::Enum { variants }, scalar) | (scalar, SchemaKind::Enum { variants }) => {
            let kept: Vec<Value> = variants
                .into_iter()
                .filter(|v| scalar.accepts_type(v))
                .collect();
            if kept.is_empty() {
                return Err(conflict(&SchemaKind::Enum { variants: kept }, &scalar));
            }
            SchemaKind::Enum { variants: kept }
        }
        (SchemaKind::Number, SchemaKind::Integer) | (SchemaKind::Integer, SchemaKind::Number) => {
            SchemaKind::Integer
        }
        (a, b) if a == b => a,
        (a, b) => return Err(conflict(&a, &b)),
    })
}

fn merge_constraints(acc: &mut Map<String, Value>, next: &Map<String, Value>) {
    for (key, value) in next {
        let tighter = match (acc.get(key), value.as_f64()) {
            (Some(current), Some(new)) => match current.as_f64() {
                Some(old) if LOWER_BOUNDS.contains(&key.as_str()) => new >= old,
                Some(old) if UPPER_BOUNDS.contains(&key.as_str()) => new <= old,
                _ => true,
            },
            _ => true,
        };
        if tighter {
            acc.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        error::SchemaError,
        schema::{Schema, SchemaKind},
    };

    #[test]
    fn test_all_of_merges_objects() {
        let schema = Schema::parse(&json!({
            "allOf": [
                {"$ref": "#/$defs/named"},
                {
                    "type": "object",
                    "properties": {"age": {"type": "integer", "minimum": 0}},
                    "required": ["age"],
                    "minProperties": 1
                }
            ],
            "$defs": {
                "named": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"],
                    "minProperties": 2
                }
            }
        }))
        .unwrap();

        let merged = schema.node(schema.deref(schema.root()));
        let SchemaKind::Object {
            properties,
            required,
        } = &merged.kind
        else {
            panic!("expected merged object, got {}", merged.kind);
        };
        let names: Vec<_> = properties.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["name", "age"]);
        assert!(required.contains("name") && required.contains("age"));
        // Lower bounds keep the larger value.
        assert_eq!(merged.constraints.get("minProperties"), Some(&json!(2)));
    }

    #[test]
    fn test_all_of_tightens_numeric_bounds() {
        let schema = Schema::parse(&json!({
            "allOf": [
                {"type": "number", "minimum": 1, "maximum": 10, "format": "a"},
                {"type": "integer", "minimum": 0, "maximum": 5, "format": "b"}
            ]
        }))
        .unwrap();
        let merged = schema.node(schema.deref(schema.root()));
        assert_eq!(merged.kind, SchemaKind::Integer);
        assert_eq!(merged.constraints.get("minimum"), Some(&json!(1)));
        assert_eq!(merged.constraints.get("maximum"), Some(&json!(5)));
        // Non-numeric conflicts: last writer wins.
        assert_eq!(merged.constraints.get("format"), Some(&json!("b")));
    }

    #[test]
    fn test_all_of_type_conflict() {
        let err = Schema::parse(&json!({
            "allOf": [{"type": "string"}, {"type": "boolean"}]
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::Unmergeable { .. }));

        let err = Schema::parse(&json!({
            "allOf": [{"type": "string"}, {"oneOf": [{"type": "string"}]}]
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::Unmergeable { .. }));
    }

    #[test]
    fn test_all_of_keeps_declared_items() {
        let schema = Schema::parse(&json!({
            "allOf": [
                {"type": "array", "items": {"type": "integer", "maximum": 5}},
                {"type": "array", "minItems": 1}
            ]
        }))
        .unwrap();
        let merged = schema.node(schema.deref(schema.root()));
        let SchemaKind::Array { items } = merged.kind else {
            panic!("expected merged array, got {}", merged.kind);
        };
        let items = schema.node(schema.deref(items));
        assert_eq!(items.kind, SchemaKind::Integer);
        assert_eq!(items.constraints.get("maximum"), Some(&json!(5)));
        assert_eq!(merged.constraints.get("minItems"), Some(&json!(1)));
    }

    #[test]
    fn test_all_of_merges_both_items() {
        let schema = Schema::parse(&json!({
            "allOf": [
                {"type": "array", "items": {"type": "string", "minLength": 2}},
                {"type": "array", "items": {"type": "string", "maxLength": 4}}
            ]
        }))
        .unwrap();
        let SchemaKind::Array { items } = schema.node(schema.deref(schema.root())).kind else {
            panic!("expected merged array");
        };
        let items = schema.node(schema.deref(items));
        assert_eq!(items.kind, SchemaKind::String);
        assert_eq!(items.constraints.get("minLength"), Some(&json!(2)));
        assert_eq!(items.constraints.get("maxLength"), Some(&json!(4)));
    }

    #[test]
    fn test_all_of_recursive_items_terminate() {
        let schema = Schema::parse(&json!({
            "allOf": [{"$ref": "#/$defs/a"}, {"$ref": "#/$defs/b"}],
            "$defs": {
                "a": {"type": "array", "items": {"$ref": "#/$defs/a"}},
                "b": {"type": "array", "items": {"$ref": "#/$defs/b"}, "minItems": 1}
            }
        }))
        .unwrap();
        let merged = schema.node(schema.deref(schema.root()));
        let SchemaKind::Array { items } = merged.kind else {
            panic!("expected merged array");
        };
        assert!(matches!(
            schema.node(schema.deref(items)).kind,
            SchemaKind::Array { .. }
        ));
    }

    #[test]
    fn test_nested_all_of() {
        let schema = Schema::parse(&json!({
            "allOf": [
                {"allOf": [{"type": "string", "minLength": 2}, {"maxLength": 9, "type": "string"}]},
                {"type": "string", "minLength": 4}
            ]
        }))
        .unwrap();
        let merged = schema.node(schema.deref(schema.root()));
        assert_eq!(merged.kind, SchemaKind::String);
        assert_eq!(merged.constraints.get("minLength"), Some(&json!(4)));
        assert_eq!(merged.constraints.get("maxLength"), Some(&json!(9)));
    }
}
