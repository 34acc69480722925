//! Value store: the single owner of the data tree being edited.
//!
//! Values live in an arena of [`ValueNode`]s addressed by [`ValueId`]. Widget
//! instances hold ids into the store, never copies. Each node tracks whether
//! it is present (absence is not `null`), whether it changed since load
//! (`dirty`), whether the user interacted with it (`touched`), and which
//! widget instance it is bound to.

use serde_json::{Map, Value};

use crate::{
    error::BindingError,
    form::InstanceId,
    schema::{escape_pointer, json_type_name},
};

/// Stable identity of a node in the [`ValueStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

/// Shape of a stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Scalar(Value),
    /// Fields in insertion order; absent fields stay listed until pruned.
    Object(Vec<(String, ValueId)>),
    Array(Vec<ValueId>),
}

#[derive(Debug, Clone)]
pub struct ValueNode {
    content: Content,
    present: bool,
    dirty: bool,
    touched: bool,
    parent: Option<ValueId>,
    original: Option<Value>,
    bound: Option<InstanceId>,
}

impl ValueNode {
    fn absent(parent: Option<ValueId>) -> Self {
        Self {
            content: Content::Scalar(Value::Null),
            present: false,
            dirty: false,
            touched: false,
            parent,
            original: None,
            bound: None,
        }
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn parent(&self) -> Option<ValueId> {
        self.parent
    }

    /// Value as loaded, `None` for nodes created after load or absent then.
    pub fn original(&self) -> Option<&Value> {
        self.original.as_ref()
    }

    pub fn bound_to(&self) -> Option<InstanceId> {
        self.bound
    }
}

/// Arena owning the whole value tree.
#[derive(Debug, Clone)]
pub struct ValueStore {
    slots: Vec<Option<ValueNode>>,
    free: Vec<usize>,
    root: ValueId,
}

impl ValueStore {
    /// Builds the store from the initial value; `None` yields an absent root.
    pub fn new(initial: Option<&Value>) -> Self {
        let mut store = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: ValueId(0),
        };
        store.root = match initial {
            Some(value) => store.build(None, value, true),
            None => store.alloc(ValueNode::absent(None)),
        };
        store
    }

    pub fn root(&self) -> ValueId {
        self.root
    }

    pub fn get(&self, id: ValueId) -> Option<&ValueNode> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn node(&self, id: ValueId) -> &ValueNode {
        match self.slots.get(id.0).and_then(Option::as_ref) {
            Some(node) => node,
            None => unreachable!("value node {id:?} used after free"),
        }
    }

    fn node_mut(&mut self, id: ValueId) -> &mut ValueNode {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(node) => node,
            None => unreachable!("value node {id:?} used after free"),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_present(&self, id: ValueId) -> bool {
        self.node(id).present
    }

    /// Reads a subtree back as JSON; `None` when the node is absent.
    pub fn to_json(&self, id: ValueId) -> Option<Value> {
        let node = self.node(id);
        if !node.present {
            return None;
        }
        Some(match &node.content {
            Content::Scalar(v) => v.clone(),
            Content::Object(fields) => Value::Object(
                fields
                    .iter()
                    .filter_map(|(k, child)| self.to_json(*child).map(|v| (k.clone(), v)))
                    .collect::<Map<String, Value>>(),
            ),
            Content::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|child| self.to_json(*child).unwrap_or(Value::Null))
                    .collect(),
            ),
        })
    }

    /// Object field by key.
    pub fn field(&self, id: ValueId, key: &str) -> Option<ValueId> {
        match &self.node(id).content {
            Content::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| *v),
            _ => None,
        }
    }

    /// Array elements in order.
    pub fn elements(&self, id: ValueId) -> &[ValueId] {
        match &self.node(id).content {
            Content::Array(items) => items,
            _ => &[],
        }
    }

    /// Returns the field's node, creating an absent one when missing.
    /// The parent must hold object content (see [`ValueStore::coerce_object`]).
    pub fn ensure_field(&mut self, id: ValueId, key: &str) -> ValueId {
        if let Some(existing) = self.field(id, key) {
            return existing;
        }
        let child = self.alloc(ValueNode::absent(Some(id)));
        if let Content::Object(fields) = &mut self.node_mut(id).content {
            fields.push((key.to_string(), child));
        }
        child
    }

    /// Makes sure the node holds object content. A present non-object value
    /// is replaced by `{}` and reported; an absent node stays absent.
    pub fn coerce_object(&mut self, id: ValueId) -> Option<BindingError> {
        if matches!(self.node(id).content, Content::Object(_)) {
            return None;
        }
        self.coerce(id, Content::Object(Vec::new()), "object")
    }

    /// Array counterpart of [`ValueStore::coerce_object`].
    pub fn coerce_array(&mut self, id: ValueId) -> Option<BindingError> {
        if matches!(self.node(id).content, Content::Array(_)) {
            return None;
        }
        self.coerce(id, Content::Array(Vec::new()), "array")
    }

    fn coerce(&mut self, id: ValueId, empty: Content, expected: &str) -> Option<BindingError> {
        let was_present = self.node(id).present;
        let actual = self.to_json(id);
        self.free_children(id);
        let node = self.node_mut(id);
        node.content = empty;
        if !was_present {
            return None;
        }
        node.dirty = true;
        let actual = actual.as_ref().map(json_type_name).unwrap_or("nothing");
        let err = BindingError::TypeMismatch {
            path: self.path(id),
            expected: expected.to_string(),
            actual: actual.to_string(),
        };
        warn!("coerced value: {err}");
        Some(err)
    }

    /// Replaces the subtree at `id` with `value`, marking it present and
    /// dirty. Absent ancestors are materialised.
    pub fn write(&mut self, id: ValueId, value: &Value) {
        trace!("write {} = {}", self.path(id), value);
        self.replace(id, Some(value), false);
        self.node_mut(id).dirty = true;
        self.materialize_parents(id);
    }

    /// Restores the subtree to `value` (or absence) and clears `dirty` across
    /// it. Originals are re-recorded from the restored value.
    pub fn restore(&mut self, id: ValueId, value: Option<&Value>) {
        self.replace(id, value, true);
        if value.is_some() {
            self.materialize_parents(id);
        }
    }

    fn replace(&mut self, id: ValueId, value: Option<&Value>, as_original: bool) {
        self.free_children(id);
        let (content, present) = match value {
            Some(value) => (self.build_content(id, value, as_original), true),
            None => (Content::Scalar(Value::Null), false),
        };
        let node = self.node_mut(id);
        node.content = content;
        node.present = present;
        if as_original {
            node.original = value.cloned();
            node.dirty = false;
        }
    }

    /// Marks every absent ancestor of `id` present so a write below becomes
    /// visible. Ancestors that appear this way count as changed.
    pub fn materialize_parents(&mut self, id: ValueId) {
        let mut cursor = self.node(id).parent;
        while let Some(current) = cursor {
            let node = self.node_mut(current);
            if node.present {
                break;
            }
            node.present = true;
            node.dirty = true;
            cursor = node.parent;
        }
    }

    /// Appends an element built from `value` to an array node.
    pub fn push_element(&mut self, id: ValueId, value: &Value) -> ValueId {
        let child = self.build(Some(id), value, false);
        self.node_mut(child).dirty = true;
        if let Content::Array(items) = &mut self.node_mut(id).content {
            items.push(child);
        }
        self.node_mut(id).dirty = true;
        self.materialize_container(id);
        child
    }

    /// Removes and frees the element at `index`.
    pub fn remove_element(&mut self, id: ValueId, index: usize) -> Option<ValueId> {
        let removed = match &mut self.node_mut(id).content {
            Content::Array(items) if index < items.len() => items.remove(index),
            _ => return None,
        };
        self.free_subtree(removed);
        self.node_mut(id).dirty = true;
        self.materialize_container(id);
        Some(removed)
    }

    /// Moves the element at `from` so it ends up at `to`.
    pub fn move_element(&mut self, id: ValueId, from: usize, to: usize) -> bool {
        let moved = match &mut self.node_mut(id).content {
            Content::Array(items) if from < items.len() && to < items.len() => {
                let item = items.remove(from);
                items.insert(to, item);
                true
            }
            _ => false,
        };
        if moved {
            self.node_mut(id).dirty = true;
            self.materialize_container(id);
        }
        moved
    }

    fn materialize_container(&mut self, id: ValueId) {
        self.node_mut(id).present = true;
        self.materialize_parents(id);
    }

    /// Drops absent object fields that no widget is bound to.
    pub fn prune_absent(&mut self, id: ValueId) {
        let Content::Object(fields) = &self.node(id).content else {
            return;
        };
        let (keep, drop): (Vec<_>, Vec<_>) = fields.iter().cloned().partition(|(_, child)| {
            let child = self.node(*child);
            child.present || child.bound.is_some()
        });
        for (_, child) in &drop {
            self.free_subtree(*child);
        }
        self.node_mut(id).content = Content::Object(keep);
    }

    pub fn set_touched(&mut self, id: ValueId) {
        self.node_mut(id).touched = true;
    }

    pub fn set_dirty(&mut self, id: ValueId) {
        self.node_mut(id).dirty = true;
    }

    /// Whether the node or anything below it changed since load.
    pub fn is_dirty_deep(&self, id: ValueId) -> bool {
        self.any_deep(id, &|node| node.dirty)
    }

    /// Whether the node or anything below it was interacted with.
    pub fn is_touched_deep(&self, id: ValueId) -> bool {
        self.any_deep(id, &|node| node.touched)
    }

    fn any_deep(&self, id: ValueId, pred: &dyn Fn(&ValueNode) -> bool) -> bool {
        let node = self.node(id);
        if pred(node) {
            return true;
        }
        match &node.content {
            Content::Scalar(_) => false,
            Content::Object(fields) => fields.iter().any(|(_, c)| self.any_deep(*c, pred)),
            Content::Array(items) => items.iter().any(|c| self.any_deep(*c, pred)),
        }
    }

    /// Attaches a widget instance. A node serves one instance at a time.
    pub fn bind(&mut self, id: ValueId, instance: InstanceId) -> Result<(), BindingError> {
        match self.node(id).bound {
            Some(bound) if bound != instance => Err(BindingError::AlreadyBound {
                path: self.path(id),
                bound,
            }),
            _ => {
                self.node_mut(id).bound = Some(instance);
                Ok(())
            }
        }
    }

    pub fn unbind(&mut self, id: ValueId) {
        if let Some(Some(node)) = self.slots.get_mut(id.0) {
            node.bound = None;
        }
    }

    /// JSON pointer of a node, rebuilt from parent links.
    pub fn path(&self, id: ValueId) -> String {
        let mut segments = Vec::new();
        let mut cursor = id;
        while let Some(parent) = self.node(cursor).parent {
            let segment = match &self.node(parent).content {
                Content::Object(fields) => fields
                    .iter()
                    .find(|(_, c)| *c == cursor)
                    .map(|(k, _)| escape_pointer(k)),
                Content::Array(items) => items
                    .iter()
                    .position(|c| *c == cursor)
                    .map(|idx| idx.to_string()),
                Content::Scalar(_) => None,
            };
            segments.push(segment.unwrap_or_else(|| "?".into()));
            cursor = parent;
        }
        segments.reverse();
        segments.iter().map(|s| format!("/{s}")).collect()
    }

    fn build(&mut self, parent: Option<ValueId>, value: &Value, as_original: bool) -> ValueId {
        let id = self.alloc(ValueNode::absent(parent));
        let content = self.build_content(id, value, as_original);
        let node = self.node_mut(id);
        node.content = content;
        node.present = true;
        if as_original {
            node.original = Some(value.clone());
        }
        id
    }

    fn build_content(&mut self, id: ValueId, value: &Value, as_original: bool) -> Content {
        match value {
            Value::Object(map) => Content::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.build(Some(id), v, as_original)))
                    .collect(),
            ),
            Value::Array(items) => Content::Array(
                items
                    .iter()
                    .map(|v| self.build(Some(id), v, as_original))
                    .collect(),
            ),
            scalar => Content::Scalar(scalar.clone()),
        }
    }

    fn alloc(&mut self, node: ValueNode) -> ValueId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                ValueId(idx)
            }
            None => {
                self.slots.push(Some(node));
                ValueId(self.slots.len() - 1)
            }
        }
    }

    fn free_children(&mut self, id: ValueId) {
        let children: Vec<ValueId> = match &self.node(id).content {
            Content::Scalar(_) => Vec::new(),
            Content::Object(fields) => fields.iter().map(|(_, c)| *c).collect(),
            Content::Array(items) => items.clone(),
        };
        for child in children {
            self.free_subtree(child);
        }
        self.node_mut(id).content = Content::Scalar(Value::Null);
    }

    fn free_subtree(&mut self, id: ValueId) {
        self.free_children(id);
        self.slots[id.0] = None;
        self.free.push(id.0);
    }
}
