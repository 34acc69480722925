use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use super::{SchemaId, SchemaKind, SchemaNode};
use crate::error::SchemaError;

/// Keywords consumed by the model itself; everything else becomes an opaque
/// constraint.
const STRUCTURAL: &[&str] = &[
    "type",
    "properties",
    "required",
    "items",
    "oneOf",
    "anyOf",
    "allOf",
    "$ref",
    "enum",
    "const",
    "default",
    "title",
    "description",
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "$comment",
    "examples",
];

const SHAPE: &[&str] = &["properties", "required", "items"];

pub(super) struct Parser<'a> {
    document: &'a Value,
    slots: Vec<Option<SchemaNode>>,
    by_pointer: HashMap<String, SchemaId>,
}

impl<'a> Parser<'a> {
    pub(super) fn new(document: &'a Value) -> Self {
        Self {
            document,
            slots: Vec::new(),
            by_pointer: HashMap::new(),
        }
    }

    pub(super) fn run(mut self) -> Result<(Vec<SchemaNode>, SchemaId), SchemaError> {
        let root = self.parse_at("#".to_string(), self.document)?;
        let mut nodes = Vec::with_capacity(self.slots.len());
        for (idx, slot) in self.slots.into_iter().enumerate() {
            match slot {
                Some(node) => nodes.push(node),
                // Every reserved slot is filled before `parse_at` returns.
                None => {
                    return Err(SchemaError::Inconsistent {
                        path: format!("#<node {idx}>"),
                        reason: "schema node was never completed".into(),
                    });
                }
            }
        }
        Ok((nodes, root))
    }

    /// Parses the schema at `pointer`, returning the existing node when the
    /// location was already visited. The slot is reserved before the body is
    /// parsed so that references back into an ancestor resolve to it.
    fn parse_at(&mut self, pointer: String, raw: &Value) -> Result<SchemaId, SchemaError> {
        if let Some(id) = self.by_pointer.get(&pointer) {
            return Ok(*id);
        }
        let id = SchemaId(self.slots.len());
        self.slots.push(None);
        self.by_pointer.insert(pointer.clone(), id);

        let node = self.parse_node(&pointer, raw)?;
        self.slots[id.0] = Some(node);
        Ok(id)
    }

    fn parse_node(&mut self, pointer: &str, raw: &Value) -> Result<SchemaNode, SchemaError> {
        let obj = match raw {
            Value::Bool(true) => return Ok(SchemaNode::new(pointer, SchemaKind::Any)),
            Value::Bool(false) => {
                return Err(SchemaError::Inconsistent {
                    path: pointer.to_string(),
                    reason: "schema `false` accepts no value".into(),
                });
            }
            Value::Object(obj) => obj,
            _ => {
                return Err(SchemaError::InvalidKeyword {
                    path: pointer.to_string(),
                    keyword: "schema".into(),
                    expected: "an object or boolean".into(),
                });
            }
        };

        let kind = self.parse_kind(pointer, obj)?;
        let mut node = SchemaNode::new(pointer, kind);
        node.title = string_keyword(pointer, obj, "title")?;
        node.description = string_keyword(pointer, obj, "description")?;
        node.default = obj.get("default").cloned();
        node.constraints = obj
            .iter()
            .filter(|(k, _)| !STRUCTURAL.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(node)
    }

    fn parse_kind(
        &mut self,
        pointer: &str,
        obj: &Map<String, Value>,
    ) -> Result<SchemaKind, SchemaError> {
        if let Some(reference) = obj.get("$ref") {
            let Value::String(reference) = reference else {
                return Err(invalid(pointer, "$ref", "a string"));
            };
            let (target_pointer, target) = self.lookup(pointer, reference)?;
            let target = self.parse_at(target_pointer, target)?;
            return Ok(SchemaKind::Ref {
                target,
                reference: reference.clone(),
            });
        }

        let combinators: Vec<&str> = ["oneOf", "anyOf", "allOf"]
            .into_iter()
            .filter(|k| obj.contains_key(*k))
            .collect();
        if combinators.len() > 1 {
            return Err(SchemaError::Inconsistent {
                path: pointer.to_string(),
                reason: format!("node combines {}", combinators.join(" and ")),
            });
        }
        if let Some(keyword) = combinators.first() {
            if let Some(extra) = ["type", "properties", "items"]
                .into_iter()
                .find(|k| obj.contains_key(*k))
            {
                return Err(SchemaError::Inconsistent {
                    path: pointer.to_string(),
                    reason: format!("`{keyword}` node must not declare `{extra}`"),
                });
            }
            let branches = self.parse_branches(pointer, keyword, &obj[*keyword])?;
            return Ok(match *keyword {
                "oneOf" => SchemaKind::OneOf(branches),
                "anyOf" => SchemaKind::AnyOf(branches),
                _ => SchemaKind::AllOf(branches),
            });
        }

        if let Some(variants) = obj.get("enum") {
            let Value::Array(variants) = variants else {
                return Err(invalid(pointer, "enum", "an array"));
            };
            reject_shape(pointer, obj, "enum")?;
            return Ok(SchemaKind::Enum {
                variants: variants.clone(),
            });
        }
        if let Some(value) = obj.get("const") {
            reject_shape(pointer, obj, "const")?;
            return Ok(SchemaKind::Enum {
                variants: vec![value.clone()],
            });
        }

        match obj.get("type") {
            None => Err(SchemaError::MissingType {
                path: pointer.to_string(),
            }),
            Some(Value::String(ty)) => self.parse_typed(pointer, ty, obj),
            Some(Value::Array(types)) => self.parse_type_list(pointer, types, obj),
            Some(_) => Err(invalid(pointer, "type", "a string or an array of strings")),
        }
    }

    fn parse_typed(
        &mut self,
        pointer: &str,
        ty: &str,
        obj: &Map<String, Value>,
    ) -> Result<SchemaKind, SchemaError> {
        let kind = match ty {
            "null" => SchemaKind::Null,
            "boolean" => SchemaKind::Boolean,
            "string" => SchemaKind::String,
            "number" => SchemaKind::Number,
            "integer" => SchemaKind::Integer,
            "object" => return self.parse_object(pointer, obj),
            "array" => return self.parse_array(pointer, obj),
            other => {
                return Err(SchemaError::UnknownType {
                    path: pointer.to_string(),
                    ty: other.to_string(),
                });
            }
        };
        reject_shape(pointer, obj, ty)?;
        Ok(kind)
    }

    /// `type: [a, b]` becomes `anyOf` over one synthetic node per type. Shape
    /// keywords only travel with the type they belong to.
    fn parse_type_list(
        &mut self,
        pointer: &str,
        types: &[Value],
        obj: &Map<String, Value>,
    ) -> Result<SchemaKind, SchemaError> {
        let mut names = Vec::with_capacity(types.len());
        for ty in types {
            match ty {
                Value::String(s) => names.push(s.as_str()),
                _ => return Err(invalid(pointer, "type", "an array of strings")),
            }
        }
        match names.as_slice() {
            [] => Err(invalid(pointer, "type", "a non-empty array")),
            [single] => self.parse_typed(pointer, single, obj),
            _ => {
                let mut branches = Vec::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    let mut single: Map<String, Value> = obj
                        .iter()
                        .filter(|(k, _)| {
                            k.as_str() != "type" && k.as_str() != "default" && {
                                !SHAPE.contains(&k.as_str()) || owns_shape(name, k)
                            }
                        })
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    single.insert("type".into(), Value::String(name.to_string()));
                    let branch_pointer = format!("{pointer}/type/{idx}");
                    branches.push(self.parse_at(branch_pointer, &Value::Object(single))?);
                }
                Ok(SchemaKind::AnyOf(branches))
            }
        }
    }

    fn parse_object(
        &mut self,
        pointer: &str,
        obj: &Map<String, Value>,
    ) -> Result<SchemaKind, SchemaError> {
        if obj.contains_key("items") {
            return Err(SchemaError::Inconsistent {
                path: pointer.to_string(),
                reason: "`items` on a non-array node".into(),
            });
        }
        let mut properties = Vec::new();
        match obj.get("properties") {
            None => {}
            Some(Value::Object(props)) => {
                for (name, raw) in props {
                    let child = format!("{pointer}/properties/{}", escape(name));
                    properties.push((name.clone(), self.parse_at(child, raw)?));
                }
            }
            Some(_) => return Err(invalid(pointer, "properties", "an object")),
        }
        let mut required = BTreeSet::new();
        match obj.get("required") {
            None => {}
            Some(Value::Array(names)) => {
                for name in names {
                    let Value::String(name) = name else {
                        return Err(invalid(pointer, "required", "an array of strings"));
                    };
                    required.insert(name.clone());
                }
            }
            Some(_) => return Err(invalid(pointer, "required", "an array of strings")),
        }
        Ok(SchemaKind::Object {
            properties,
            required,
        })
    }

    fn parse_array(
        &mut self,
        pointer: &str,
        obj: &Map<String, Value>,
    ) -> Result<SchemaKind, SchemaError> {
        if let Some(extra) = ["properties", "required"]
            .into_iter()
            .find(|k| obj.contains_key(*k))
        {
            return Err(SchemaError::Inconsistent {
                path: pointer.to_string(),
                reason: format!("`{extra}` on a non-object node"),
            });
        }
        let items_pointer = format!("{pointer}/items");
        let items = match obj.get("items") {
            None => self.parse_at(items_pointer, &Value::Bool(true))?,
            Some(raw @ (Value::Object(_) | Value::Bool(_))) => self.parse_at(items_pointer, raw)?,
            Some(_) => return Err(invalid(pointer, "items", "a single schema")),
        };
        Ok(SchemaKind::Array { items })
    }

    fn parse_branches(
        &mut self,
        pointer: &str,
        keyword: &str,
        raw: &Value,
    ) -> Result<Vec<SchemaId>, SchemaError> {
        let Value::Array(alternatives) = raw else {
            return Err(invalid(pointer, keyword, "an array of schemas"));
        };
        if alternatives.is_empty() {
            return Err(invalid(pointer, keyword, "a non-empty array"));
        }
        alternatives
            .iter()
            .enumerate()
            .map(|(idx, alt)| self.parse_at(format!("{pointer}/{keyword}/{idx}"), alt))
            .collect()
    }

    /// Resolves a local reference to its canonical pointer and raw value.
    fn lookup(&self, pointer: &str, reference: &str) -> Result<(String, &'a Value), SchemaError> {
        let missing = || SchemaError::MissingRef {
            path: pointer.to_string(),
            reference: reference.to_string(),
        };
        let fragment = reference.strip_prefix('#').ok_or_else(missing)?;
        let target = if fragment.is_empty() {
            Some(self.document)
        } else {
            self.document.pointer(fragment)
        };
        let target = target.ok_or_else(missing)?;
        Ok((format!("#{fragment}"), target))
    }
}

fn owns_shape(ty: &str, keyword: &str) -> bool {
    match keyword {
        "properties" | "required" => ty == "object",
        "items" => ty == "array",
        _ => true,
    }
}

fn reject_shape(
    pointer: &str,
    obj: &Map<String, Value>,
    ty: &str,
) -> Result<(), SchemaError> {
    if let Some(extra) = SHAPE.iter().find(|k| obj.contains_key(**k)) {
        return Err(SchemaError::Inconsistent {
            path: pointer.to_string(),
            reason: format!("`{extra}` on a `{ty}` node"),
        });
    }
    Ok(())
}

fn string_keyword(
    pointer: &str,
    obj: &Map<String, Value>,
    keyword: &str,
) -> Result<Option<String>, SchemaError> {
    match obj.get(keyword) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(pointer, keyword, "a string")),
    }
}

fn invalid(pointer: &str, keyword: &str, expected: &str) -> SchemaError {
    SchemaError::InvalidKeyword {
        path: pointer.to_string(),
        keyword: keyword.to_string(),
        expected: expected.to_string(),
    }
}

/// JSON pointer escaping for property names.
pub(crate) fn escape(name: &str) -> String {
    name.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pointer_escaping() {
        assert_eq!(escape("a/b"), "a~1b");
        assert_eq!(escape("x~y"), "x~0y");
    }

    #[test]
    fn test_definitions_and_escaped_refs() {
        let doc = json!({
            "type": "object",
            "properties": {
                "p": {"$ref": "#/definitions/a~1b"}
            },
            "definitions": {
                "a/b": {"type": "integer"}
            }
        });
        let (nodes, root) = Parser::new(&doc).run().unwrap();
        let SchemaKind::Object { properties, .. } = &nodes[root.0].kind else {
            panic!("expected object");
        };
        let SchemaKind::Ref { target, reference } = &nodes[properties[0].1.0].kind else {
            panic!("expected ref");
        };
        assert_eq!(reference, "#/definitions/a~1b");
        assert_eq!(nodes[target.0].kind, SchemaKind::Integer);
    }

    #[test]
    fn test_remote_ref_is_missing() {
        let doc = json!({"$ref": "https://example.com/schema.json"});
        let err = Parser::new(&doc).run().unwrap_err();
        assert!(matches!(err, SchemaError::MissingRef { .. }));
    }

    #[test]
    fn test_bad_keyword_shapes() {
        let doc = json!({"type": "object", "required": "a"});
        let err = Parser::new(&doc).run().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidKeyword { keyword, .. } if keyword == "required"));

        let doc = json!({"oneOf": []});
        let err = Parser::new(&doc).run().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidKeyword { keyword, .. } if keyword == "oneOf"));

        let doc = json!({"type": "array", "items": [{"type": "string"}]});
        let err = Parser::new(&doc).run().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidKeyword { keyword, .. } if keyword == "items"));
    }

    #[test]
    fn test_array_without_items_accepts_anything() {
        let doc = json!({"type": "array"});
        let (nodes, root) = Parser::new(&doc).run().unwrap();
        let SchemaKind::Array { items } = nodes[root.0].kind else {
            panic!("expected array");
        };
        assert_eq!(nodes[items.0].kind, SchemaKind::Any);
    }
}
