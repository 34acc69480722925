use serde_json::{Map, Value};

use super::{Body, Form, Instance, InstanceId, Segment};
use crate::{
    error::{FormError, Result},
    schema::{Schema, SchemaId, SchemaKind},
    value::ValueId,
    widget::WidgetKind,
};

/// Initial document when the caller supplies no value: the root default,
/// else the defaults found below an object root, else an empty container.
pub(super) fn defaults_document(schema: &Schema) -> Option<Value> {
    let root = schema.root();
    if let Some(value) = collect_defaults(schema, root, &mut Vec::new()) {
        return Some(value);
    }
    match &schema.node(schema.deref(root)).kind {
        SchemaKind::Object { .. } => Some(Value::Object(Map::new())),
        SchemaKind::Array { .. } => Some(Value::Array(Vec::new())),
        _ => None,
    }
}

fn collect_defaults(schema: &Schema, id: SchemaId, path: &mut Vec<SchemaId>) -> Option<Value> {
    if let Some(default) = schema.default_of(id) {
        return Some(default.clone());
    }
    let resolved = schema.deref(id);
    let SchemaKind::Object { properties, .. } = &schema.node(resolved).kind else {
        return None;
    };
    if path.contains(&resolved) {
        return None;
    }
    path.push(resolved);
    let fields: Map<String, Value> = properties
        .iter()
        .filter_map(|(key, prop)| collect_defaults(schema, *prop, path).map(|v| (key.clone(), v)))
        .collect();
    path.pop();
    (!fields.is_empty()).then_some(Value::Object(fields))
}

impl Form {
    pub(super) fn alloc(
        &mut self,
        schema: SchemaId,
        value: ValueId,
        parent: Option<InstanceId>,
        segment: Option<Segment>,
        required: bool,
        depth: usize,
    ) -> InstanceId {
        let id = InstanceId(self.instances.len());
        self.instances.push(Some(Instance {
            schema,
            resolved: schema,
            branch: None,
            kind: WidgetKind::Any,
            value,
            parent,
            segment,
            required,
            depth,
            children: Vec::new(),
            body: Body::Deferred,
            issues: Vec::new(),
            pending: None,
            errors_below: 0,
            pending_below: 0,
        }));
        id
    }

    /// Effective schema node and active branch for a declared node and a
    /// value. Nested alternatives resolve in turn; the reported branch is
    /// the outermost one.
    pub(crate) fn resolve(&self, schema: SchemaId, value: Option<&Value>) -> (SchemaId, Option<usize>) {
        let mut id = self.schema.deref(schema);
        let mut branch = None;
        while let SchemaKind::OneOf(branches) | SchemaKind::AnyOf(branches) = &self.schema.node(id).kind {
            let picked = value
                .and_then(|v| branches.iter().position(|b| self.matches_directly(*b, v)))
                .unwrap_or(0);
            let Some(next) = branches.get(picked) else {
                break;
            };
            branch.get_or_insert(picked);
            id = self.schema.deref(*next);
        }
        (id, branch)
    }

    /// Whether `value` satisfies a branch's own constraints: its type, its
    /// required keys, discriminating `const`/`enum` properties and the
    /// synchronous validator. Children are not descended into.
    fn matches_directly(&self, branch: SchemaId, value: &Value) -> bool {
        let node = self.schema.node(self.schema.deref(branch));
        match &node.kind {
            SchemaKind::OneOf(branches) | SchemaKind::AnyOf(branches) => {
                branches.iter().any(|b| self.matches_directly(*b, value))
            }
            kind => {
                if !kind.accepts_type(value) {
                    return false;
                }
                if let SchemaKind::Object {
                    properties,
                    required,
                } = kind
                {
                    if !required.iter().all(|key| value.get(key).is_some()) {
                        return false;
                    }
                    let discriminated = properties.iter().all(|(key, prop)| {
                        match (value.get(key), &self.schema.node(self.schema.deref(*prop)).kind) {
                            (Some(v), SchemaKind::Enum { variants }) => variants.contains(v),
                            _ => true,
                        }
                    });
                    if !discriminated {
                        return false;
                    }
                }
                self.validator.check(node, value).is_empty()
            }
        }
    }

    /// Whether `value` directly matches an alternative other than the active
    /// branch of `id`.
    pub(super) fn matches_other_branch(&self, id: InstanceId, value: &Value) -> bool {
        let Some(inst) = self.inst(id) else {
            return false;
        };
        let Some(active) = inst.branch else {
            return false;
        };
        match &self.schema.node(self.schema.deref(inst.schema)).kind {
            SchemaKind::OneOf(branches) | SchemaKind::AnyOf(branches) => branches
                .iter()
                .enumerate()
                .any(|(idx, b)| idx != active && self.matches_directly(*b, value)),
            _ => false,
        }
    }

    /// Builds the widget and children of an allocated instance. `path` holds
    /// the schema nodes being expanded above it; `force` expands a node the
    /// cycle guard would otherwise defer.
    pub(super) fn populate(&mut self, id: InstanceId, path: &mut Vec<SchemaId>, force: bool) {
        let Some(inst) = self.inst(id) else {
            return;
        };
        let (schema, vid, depth) = (inst.schema, inst.value, inst.depth);
        let declared = self.schema.deref(schema);
        let current = self.store.to_json(vid);
        let (resolved, branch) = self.resolve(schema, current.as_ref());
        let kind = self
            .schema
            .node(resolved)
            .kind
            .widget_kind()
            .unwrap_or(WidgetKind::Any);

        if let Err(err) = self.store.bind(vid, id) {
            warn!("{err}");
            self.binding_errors.push(err);
        }

        let recursive = path.contains(&declared) && current.is_none();
        let too_deep = depth > self.options.max_depth;
        let body = if !force && (recursive || too_deep) {
            debug!(
                "deferring {} ({kind}) at depth {depth}",
                self.store.path(vid)
            );
            Body::Deferred
        } else {
            let coerced = match kind {
                WidgetKind::Object => self.store.coerce_object(vid),
                WidgetKind::Array => self.store.coerce_array(vid),
                _ => None,
            };
            self.binding_errors.extend(coerced);
            match self.registry.create_or_fallback(kind) {
                Ok(widget) => Body::Widget(widget),
                Err(err) => {
                    warn!("{err} at {}", self.store.path(vid));
                    Body::Broken(err)
                }
            }
        };
        let expand = matches!(body, Body::Widget(_)) && kind.is_composite();

        if let Some(inst) = self.inst_mut(id) {
            inst.resolved = resolved;
            inst.branch = branch;
            inst.kind = kind;
            inst.body = body;
            inst.children.clear();
        }
        self.with_binding(id, |widget, binding| widget.bind(binding));

        let mut children = Vec::new();
        if expand {
            path.push(declared);
            match self.schema.node(resolved).kind.clone() {
                SchemaKind::Object {
                    properties,
                    required,
                } => {
                    for (key, prop) in properties {
                        let child_value = self.store.ensure_field(vid, &key);
                        let is_required = required.contains(&key);
                        let child = self.alloc(
                            prop,
                            child_value,
                            Some(id),
                            Some(Segment::Key(key)),
                            is_required,
                            depth + 1,
                        );
                        children.push(child);
                        self.populate(child, path, false);
                    }
                }
                SchemaKind::Array { items } => {
                    let elements = self.store.elements(vid).to_vec();
                    for (idx, element) in elements.into_iter().enumerate() {
                        let child = self.alloc(
                            items,
                            element,
                            Some(id),
                            Some(Segment::Index(idx)),
                            false,
                            depth + 1,
                        );
                        children.push(child);
                        self.populate(child, path, false);
                    }
                }
                _ => {}
            }
            path.pop();
        }

        let (errors, pending) = children
            .iter()
            .filter_map(|c| self.inst(*c))
            .fold((0, 0), |(e, p), c| (e + c.errors_below, p + c.pending_below));
        if let Some(inst) = self.inst_mut(id) {
            inst.children = children;
            inst.issues.clear();
            inst.pending = None;
            inst.errors_below = errors;
            inst.pending_below = pending;
        }
        self.pending.remove(&id);
        if self.validate_on_dispatch {
            self.revalidate_local(id);
        }
    }

    /// Drops an instance and its subtree, unbinding every value node.
    pub(super) fn drop_instance(&mut self, id: InstanceId) {
        let Some(mut inst) = self.instances.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        for child in std::mem::take(&mut inst.children) {
            self.drop_instance(child);
        }
        if let Body::Widget(widget) = &mut inst.body {
            widget.unbind();
        }
        self.store.unbind(inst.value);
        self.pending.remove(&id);
    }

    /// Schema nodes being expanded above `id`, root first.
    pub(super) fn ancestor_path(&self, id: InstanceId) -> Vec<SchemaId> {
        let mut path = Vec::new();
        let mut cursor = self.inst(id).and_then(|i| i.parent);
        while let Some(parent) = cursor.and_then(|p| self.inst(p)) {
            path.push(self.schema.deref(parent.schema));
            cursor = parent.parent;
        }
        path.reverse();
        path
    }

    /// Re-dispatches the subtree under `id` in place. The instance keeps its
    /// id; children are detached (and their values unbound) before the new
    /// ones attach. Ancestor aggregates are adjusted by the difference.
    pub(super) fn rebuild(&mut self, id: InstanceId, force: bool) {
        let Some(inst) = self.inst_mut(id) else {
            return;
        };
        let before = (inst.errors_below, inst.pending_below);
        let children = std::mem::take(&mut inst.children);
        if let Body::Widget(widget) = &mut inst.body {
            widget.unbind();
        }
        let (vid, parent, old_branch) = (inst.value, inst.parent, inst.branch);
        for child in children {
            self.drop_instance(child);
        }
        self.store.unbind(vid);
        self.store.prune_absent(vid);

        let mut path = self.ancestor_path(id);
        self.populate(id, &mut path, force);

        if let Some(inst) = self.inst(id) {
            if inst.branch != old_branch {
                debug!(
                    "{}: branch {:?} -> {:?}",
                    self.path_of(id),
                    old_branch,
                    inst.branch
                );
            }
            let delta_errors = inst.errors_below as isize - before.0 as isize;
            let delta_pending = inst.pending_below as isize - before.1 as isize;
            self.propagate(parent, delta_errors, delta_pending);
        }
        debug!("rebuilt {}", self.path_of(id));
    }

    /// Outermost instance from `id` up whose active branch no longer matches
    /// its current value.
    pub(super) fn stale_branch(&self, id: InstanceId) -> Option<InstanceId> {
        let mut stale = None;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let inst = self.inst(current)?;
            if inst.branch.is_some() {
                let value = self.store.to_json(inst.value);
                let (resolved, branch) = self.resolve(inst.schema, value.as_ref());
                if branch != inst.branch || resolved != inst.resolved {
                    stale = Some(current);
                }
            }
            cursor = inst.parent;
        }
        stale
    }

    /// Expands a deferred instance one level.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownInstance`] for a stale id.
    pub fn expand(&mut self, id: InstanceId) -> Result<()> {
        if matches!(self.checked(id)?.body, Body::Deferred) {
            self.rebuild(id, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "child": {"$ref": "#"}
            }
        })
    }

    #[test]
    fn test_defaults_document() {
        let schema = Schema::parse(&json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer", "default": 1},
                "b": {"type": "string"},
                "n": {
                    "type": "object",
                    "properties": {"on": {"type": "boolean", "default": true}}
                },
                "self": {"$ref": "#"}
            }
        }))
        .unwrap();
        assert_eq!(
            defaults_document(&schema),
            Some(json!({"a": 1, "n": {"on": true}}))
        );

        let schema = Schema::parse(&json!({"type": "string"})).unwrap();
        assert_eq!(defaults_document(&schema), None);
    }

    #[test]
    fn test_recursion_stops_below_value() {
        let value = json!({"name": "1", "child": {"name": "2", "child": {"name": "3"}}});
        let form = Form::new(&tree(), Some(value.clone())).unwrap();
        assert_eq!(form.value(), value);

        let third = form.find("/child/child").unwrap();
        assert!(!form.instance(third).unwrap().deferred);
        let fourth = form.find("/child/child/child").unwrap();
        let view = form.instance(fourth).unwrap();
        assert!(view.deferred);
        assert!(view.children.is_empty());
    }

    #[test]
    fn test_expand_one_level() {
        let mut form = Form::new(&tree(), Some(json!({}))).unwrap();
        let child = form.find("/child").unwrap();
        assert!(form.instance(child).unwrap().deferred);

        form.expand(child).unwrap();
        let view = form.instance(child).unwrap();
        assert!(!view.deferred);
        assert_eq!(view.children.len(), 2);
        let grandchild = form.find("/child/child").unwrap();
        assert!(form.instance(grandchild).unwrap().deferred);
        assert_eq!(form.value(), json!({}));
    }

    #[test]
    fn test_max_depth_defers() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "object", "properties": {
                    "b": {"type": "object", "properties": {"c": {"type": "string"}}}
                }}
            }
        });
        let form = Form::builder()
            .options(super::super::FormOptions::default().with_max_depth(1))
            .build(&schema, Some(json!({"a": {"b": {"c": "x"}}})))
            .unwrap();
        let b = form.find("/a/b").unwrap();
        assert!(form.instance(b).unwrap().deferred);
        assert_eq!(form.value(), json!({"a": {"b": {"c": "x"}}}));
    }

    #[test]
    fn test_validate_all_reaches_below_max_depth() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "object", "properties": {
                    "b": {"type": "object", "properties": {
                        "c": {"type": "string", "minLength": 5}
                    }}
                }}
            }
        });
        let mut form = Form::builder()
            .options(super::super::FormOptions::default().with_max_depth(1))
            .build(&schema, Some(json!({"a": {"b": {"c": "x"}}})))
            .unwrap();
        let result = form.result();
        assert!(!result.valid);
        assert_eq!(result.errors[0].path, "/a/b");
        assert_eq!(result.errors[0].code, "deferred");

        let result = form.validate_all();
        assert!(!result.valid);
        let found: Vec<_> = result
            .errors
            .iter()
            .map(|e| (e.path.as_str(), e.code.as_str()))
            .collect();
        assert_eq!(found, [("/a/b/c", "minLength")]);
        assert_eq!(form.value(), json!({"a": {"b": {"c": "x"}}}));
    }

    #[test]
    fn test_branch_selection() {
        let schema = json!({
            "oneOf": [
                {"type": "object", "properties": {"kind": {"const": "a"}, "x": {"type": "integer"}}, "required": ["kind"]},
                {"type": "object", "properties": {"kind": {"const": "b"}, "y": {"type": "string"}}, "required": ["kind"]},
                {"type": "string", "maxLength": 3}
            ]
        });
        let branch = |value: Value| {
            let form = Form::new(&schema, Some(value)).unwrap();
            form.instance(form.root()).unwrap().branch
        };
        assert_eq!(branch(json!({"kind": "a"})), Some(0));
        assert_eq!(branch(json!({"kind": "b", "y": "z"})), Some(1));
        assert_eq!(branch(json!("abc")), Some(2));
        // Nothing matches: the first alternative stays displayable.
        assert_eq!(branch(json!("abcdef")), Some(0));
    }

    #[test]
    fn test_coerced_container_is_recorded() {
        let schema = json!({
            "type": "object",
            "properties": {"list": {"type": "array", "items": {"type": "string"}}}
        });
        let form = Form::new(&schema, Some(json!({"list": 5}))).unwrap();
        assert_eq!(form.binding_errors().len(), 1);
        assert_eq!(form.value(), json!({"list": []}));
        assert!(form.is_dirty());
    }
}
