use std::sync::Arc;

use serde_json::Value;

use super::{Body, Form, InstanceId, Segment, split_pointer};
use crate::{
    error::{FormError, Result, WidgetError},
    schema::SchemaKind,
    validator::Issue,
    widget::Widget,
};

/// What produced a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// A value committed through a widget.
    Edit,
    /// An array item added, removed or moved.
    Structure,
    Reset,
    /// An asynchronous check resolved.
    Validation,
}

/// Notification sent to subscribers after every committed change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// JSON pointer of the changed node.
    pub path: String,
    /// Its value after the change, `None` when absent.
    pub value: Option<Value>,
    /// Whole-form validity after the change.
    pub valid: bool,
    pub cause: ChangeCause,
}

pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Presence around an edited node, taken before the mutation.
struct Before {
    present: bool,
    absent_above: Vec<InstanceId>,
}

impl Form {
    /// Feeds raw user input to the widget at `id`.
    ///
    /// The widget normalises the input; the result is written to the value
    /// store, the node is validated, then ancestors are notified and the
    /// change listeners fire. Input the widget rejects becomes a validation
    /// error on the node and nothing is written. A deferred instance is
    /// expanded first.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownInstance`] when `id` no longer exists.
    pub fn on_change(&mut self, id: InstanceId, input: Value) -> Result<()> {
        self.expand(id)?;
        let outcome = self.with_binding(id, |widget, binding| {
            widget.on_change(binding, input.clone())
        });
        let value = match outcome {
            Some(Ok(value)) => value,
            // Input for another alternative goes to that branch's widget
            // once the node is re-dispatched.
            Some(Err(_)) if self.matches_other_branch(id, &input) => input,
            Some(Err(err)) => {
                self.reject(id, err);
                return Ok(());
            }
            None => input,
        };

        let inst = self.checked(id)?;
        let (vid, structural) = (inst.value, inst.kind.is_composite());
        let before = self.before(id);
        self.store.write(vid, &value);
        self.store.set_touched(vid);
        self.finish_edit(id, before, structural, ChangeCause::Edit);
        Ok(())
    }

    /// [`Form::on_change`] addressed by JSON pointer, expanding deferred
    /// instances on the way.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownPath`] when no schema node covers `pointer`.
    pub fn set(&mut self, pointer: &str, value: Value) -> Result<()> {
        let id = self.locate(pointer)?;
        self.on_change(id, value)
    }

    /// Like [`Form::find`], but expands deferred instances along the way.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownPath`] when no schema node covers `pointer`.
    pub fn locate(&mut self, pointer: &str) -> Result<InstanceId> {
        let unknown = || FormError::UnknownPath(pointer.to_string());
        let segments = split_pointer(pointer).ok_or_else(unknown)?;
        let mut current = self.root;
        for segment in segments {
            self.expand(current)?;
            current = self.child_at(current, &segment).ok_or_else(unknown)?;
        }
        Ok(current)
    }

    /// Records user interaction without changing the value.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownInstance`] when `id` no longer exists.
    pub fn touch(&mut self, id: InstanceId) -> Result<()> {
        let vid = self.checked(id)?.value;
        self.store.set_touched(vid);
        Ok(())
    }

    /// Appends an element seeded from the item schema's default to the
    /// array at `id` and returns the new element's instance.
    ///
    /// # Errors
    ///
    /// [`FormError::NotAnArray`] when `id` is not a bound array.
    pub fn add_item(&mut self, id: InstanceId) -> Result<InstanceId> {
        let items = self.array_items(id)?;
        let inst = self.checked(id)?;
        let (vid, depth, index) = (inst.value, inst.depth, inst.children.len());
        let before = self.before(id);

        let seed = self.schema.seed_value(items);
        let element = self.store.push_element(vid, &seed);
        let child = self.alloc(
            items,
            element,
            Some(id),
            Some(Segment::Index(index)),
            false,
            depth + 1,
        );
        if let Some(inst) = self.inst_mut(id) {
            inst.children.push(child);
        }
        let mut path = self.ancestor_path(child);
        self.populate(child, &mut path, false);
        let counts = self.counts(child);
        self.propagate(Some(id), counts.0, counts.1);

        let child_path = self.path_of(child);
        debug!("added item {child_path}");
        self.finish_edit(id, before, false, ChangeCause::Structure);
        self.find(&child_path).ok_or(FormError::UnknownPath(child_path))
    }

    /// Removes element `index` from the array at `id`. Value and instance
    /// sequences change together and later elements are re-indexed.
    ///
    /// # Errors
    ///
    /// [`FormError::NotAnArray`] or [`FormError::IndexOutOfRange`].
    pub fn remove_item(&mut self, id: InstanceId, index: usize) -> Result<()> {
        self.array_items(id)?;
        self.check_index(id, index)?;
        let vid = self.checked(id)?.value;
        let before = self.before(id);

        let child = match self.inst_mut(id) {
            Some(inst) => inst.children.remove(index),
            None => return Err(FormError::UnknownInstance(id)),
        };
        let counts = self.counts(child);
        self.propagate(Some(id), -counts.0, -counts.1);
        self.drop_instance(child);
        self.store.remove_element(vid, index);
        self.reindex(id);

        debug!("removed item {index} of {}", self.path_of(id));
        self.finish_edit(id, before, false, ChangeCause::Structure);
        Ok(())
    }

    /// Moves element `from` of the array at `id` to position `to`.
    ///
    /// # Errors
    ///
    /// [`FormError::NotAnArray`] or [`FormError::IndexOutOfRange`].
    pub fn move_item(&mut self, id: InstanceId, from: usize, to: usize) -> Result<()> {
        self.array_items(id)?;
        self.check_index(id, from)?;
        self.check_index(id, to)?;
        let vid = self.checked(id)?.value;
        if from == to {
            return Ok(());
        }

        self.store.move_element(vid, from, to);
        if let Some(inst) = self.inst_mut(id) {
            let moved = inst.children.remove(from);
            inst.children.insert(to, moved);
        }
        let before = self.before(id);
        self.reindex(id);
        self.finish_edit(id, before, false, ChangeCause::Structure);
        Ok(())
    }

    /// Restores the node to its loaded value, else its schema default, else
    /// (for array elements) a fresh seed, else absence. Clears `dirty` across
    /// the subtree and re-dispatches it.
    ///
    /// # Errors
    ///
    /// [`FormError::UnknownInstance`] when `id` no longer exists.
    pub fn reset(&mut self, id: InstanceId) -> Result<()> {
        let inst = self.checked(id)?;
        let (vid, schema) = (inst.value, inst.schema);
        let element = matches!(inst.segment, Some(Segment::Index(_)));
        let target = self
            .store
            .get(vid)
            .and_then(|node| node.original().cloned())
            .or_else(|| self.schema.default_of(schema).cloned())
            .or_else(|| element.then(|| self.schema.seed_value(schema)));

        if let Some(widget) = self.widget_mut(id) {
            widget.reset();
        }
        let before = self.before(id);
        self.store.restore(vid, target.as_ref());
        self.finish_edit(id, before, true, ChangeCause::Reset);
        Ok(())
    }

    /// Common tail of every mutation: re-dispatch what the change made stale,
    /// validate upwards, bubble to ancestor widgets, then notify.
    fn finish_edit(
        &mut self,
        id: InstanceId,
        before: Before,
        structural: bool,
        cause: ChangeCause,
    ) {
        let path = self.path_of(id);
        let anchor = match self.stale_branch(id) {
            Some(target) => {
                self.rebuild(target, false);
                target
            }
            None if structural => {
                self.rebuild(id, false);
                id
            }
            None => {
                self.with_binding(id, |widget, binding| widget.bind(binding));
                self.revalidate(id);
                id
            }
        };

        // Members that appeared or vanished change their parent's counts.
        let mut flipped: Vec<InstanceId> = before
            .absent_above
            .iter()
            .copied()
            .filter(|a| self.is_present(*a))
            .collect();
        if self.inst(id).is_some() && self.is_present(id) != before.present {
            flipped.push(id);
        }
        let reshaped: Vec<InstanceId> = flipped
            .iter()
            .filter_map(|f| self.inst(*f).and_then(|i| i.parent))
            .collect();

        let above = self.ancestors(anchor);
        self.revalidate_ancestors(anchor, &reshaped);
        // Containers that just appeared now owe their required children.
        for container in before.absent_above.into_iter().filter(|a| above.contains(a)) {
            let children = self
                .inst(container)
                .map(|i| i.children.clone())
                .unwrap_or_default();
            for child in children {
                if self.inst(child).is_some_and(|c| c.required) {
                    self.revalidate(child);
                }
            }
        }

        let mut chain = above;
        if anchor != id {
            chain.insert(0, anchor);
        }
        for ancestor in chain {
            if let Some(widget) = self.widget_mut(ancestor) {
                widget.on_child_change(&path);
            }
        }
        self.notify_path(path, cause);
    }

    /// Records rejected input as an error on the node. The stored value is
    /// unchanged, so no asynchronous check is started for it.
    fn reject(&mut self, id: InstanceId, err: WidgetError) {
        debug!("{}: input rejected: {err}", self.path_of(id));
        let (mut issues, _) = self.sync_issues(id);
        issues.push(Issue::new(err.code, err.message));
        let (delta_errors, delta_pending) = self.replace_direct(id, issues, None);
        let Some(inst) = self.inst(id) else {
            return;
        };
        let (vid, parent) = (inst.value, inst.parent);
        self.store.set_touched(vid);
        self.propagate(parent, delta_errors, delta_pending);
    }

    pub(super) fn notify(&self, id: InstanceId, cause: ChangeCause) {
        self.notify_path(self.path_of(id), cause);
    }

    fn notify_path(&self, path: String, cause: ChangeCause) {
        if self.listeners.is_empty() {
            return;
        }
        let event = ChangeEvent {
            value: self.value_at(&path),
            valid: self.is_valid(),
            path,
            cause,
        };
        for listener in &self.listeners {
            listener(&event);
        }
    }

    fn array_items(&self, id: InstanceId) -> Result<crate::schema::SchemaId> {
        let inst = self.checked(id)?;
        match (&inst.body, &self.schema.node(inst.resolved).kind) {
            (Body::Widget(_), SchemaKind::Array { items }) => Ok(*items),
            _ => Err(FormError::NotAnArray {
                path: self.path_of(id),
            }),
        }
    }

    fn check_index(&self, id: InstanceId, index: usize) -> Result<()> {
        let len = self.checked(id)?.children.len();
        if index < len {
            Ok(())
        } else {
            Err(FormError::IndexOutOfRange {
                path: self.path_of(id),
                index,
                len,
            })
        }
    }

    fn reindex(&mut self, id: InstanceId) {
        let children = self.inst(id).map(|i| i.children.clone()).unwrap_or_default();
        for (idx, child) in children.into_iter().enumerate() {
            if let Some(inst) = self.inst_mut(child) {
                inst.segment = Some(Segment::Index(idx));
            }
        }
    }

    fn counts(&self, id: InstanceId) -> (isize, isize) {
        self.inst(id).map_or((0, 0), |i| {
            (i.errors_below as isize, i.pending_below as isize)
        })
    }

    /// Ancestors of `id`, nearest first.
    fn ancestors(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut cursor = self.inst(id).and_then(|i| i.parent);
        while let Some(current) = cursor {
            out.push(current);
            cursor = self.inst(current).and_then(|i| i.parent);
        }
        out
    }

    fn is_present(&self, id: InstanceId) -> bool {
        self.inst(id).is_some_and(|i| self.store.is_present(i.value))
    }

    fn before(&self, id: InstanceId) -> Before {
        Before {
            present: self.is_present(id),
            absent_above: self
                .ancestors(id)
                .into_iter()
                .filter(|a| !self.is_present(*a))
                .collect(),
        }
    }

    fn widget_mut(&mut self, id: InstanceId) -> Option<&mut (dyn Widget + 'static)> {
        match &mut self.inst_mut(id)?.body {
            Body::Widget(widget) => Some(widget.as_mut()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn list_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {"type": "string", "default": "new"}
                }
            }
        })
    }

    #[test]
    fn test_boolean_toggle() {
        let mut form = Form::new(&json!({"type": "boolean", "default": false}), None).unwrap();
        assert_eq!(form.value(), json!(false));
        assert!(form.is_valid());
        assert!(!form.is_dirty());

        form.on_change(form.root(), json!(true)).unwrap();
        assert_eq!(form.value(), json!(true));
        assert!(form.is_dirty());
        assert!(form.is_touched());
        assert!(form.is_valid());
    }

    #[test]
    fn test_rejected_input_is_a_field_error() {
        let schema = json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}, "s": {"type": "string"}}
        });
        let mut form = Form::new(&schema, Some(json!({"n": 1, "s": "x"}))).unwrap();
        form.set("/n", json!("abc")).unwrap();
        assert_eq!(form.value(), json!({"n": 1, "s": "x"}));
        let result = form.result();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, "input");

        form.set("/n", json!("12")).unwrap();
        assert!(form.is_valid());
        assert_eq!(form.value_at("/n"), Some(json!(12)));
    }

    #[test]
    fn test_sparse_write_materializes_parent() {
        let schema = json!({
            "type": "object",
            "properties": {
                "server": {
                    "type": "object",
                    "properties": {
                        "host": {"type": "string"},
                        "port": {"type": "integer"}
                    },
                    "required": ["port"]
                }
            }
        });
        let mut form = Form::new(&schema, Some(json!({}))).unwrap();
        assert!(form.is_valid());

        form.set("/server/host", json!("localhost")).unwrap();
        assert_eq!(form.value(), json!({"server": {"host": "localhost"}}));
        let result = form.result();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "/server/port");

        form.set("/server/port", json!(8080)).unwrap();
        assert!(form.is_valid());
    }

    #[test]
    fn test_add_remove_items() {
        let mut form = Form::new(&list_schema(), Some(json!({"items": ["a", "b"]}))).unwrap();
        let list = form.find("/items").unwrap();

        let added = form.add_item(list).unwrap();
        assert_eq!(form.path_of(added), "/items/2");
        assert_eq!(form.value_at("/items"), Some(json!(["a", "b", "new"])));

        form.remove_item(list, 0).unwrap();
        assert_eq!(form.value_at("/items"), Some(json!(["b", "new"])));
        assert_eq!(form.path_of(added), "/items/1");
        assert_eq!(form.instance(list).unwrap().children.len(), 2);

        let err = form.remove_item(list, 5).unwrap_err();
        assert!(matches!(err, FormError::IndexOutOfRange { index: 5, len: 2, .. }));
        let err = form.add_item(form.root()).unwrap_err();
        assert!(matches!(err, FormError::NotAnArray { .. }));
    }

    #[test]
    fn test_move_item_keeps_correspondence() {
        let mut form = Form::new(&list_schema(), Some(json!({"items": ["a", "b", "c"]}))).unwrap();
        let list = form.find("/items").unwrap();
        let c = form.find("/items/2").unwrap();
        form.move_item(list, 2, 0).unwrap();
        assert_eq!(form.value_at("/items"), Some(json!(["c", "a", "b"])));
        assert_eq!(form.path_of(c), "/items/0");
        assert_eq!(form.instance(c).unwrap().value, Some(json!("c")));
    }

    #[test]
    fn test_add_to_absent_array() {
        let mut form = Form::new(&list_schema(), Some(json!({}))).unwrap();
        let list = form.find("/items").unwrap();
        form.add_item(list).unwrap();
        assert_eq!(form.value(), json!({"items": ["new"]}));
    }

    #[test]
    fn test_branch_switch_rebuilds_only_that_subtree() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "target": {
                    "oneOf": [
                        {"type": "string"},
                        {"type": "object", "properties": {"host": {"type": "string"}}}
                    ]
                }
            }
        });
        let mut form = Form::new(&schema, Some(json!({"name": "n", "target": "t"}))).unwrap();
        form.set("/name", json!("m")).unwrap();
        let name = form.find("/name").unwrap();
        let target = form.find("/target").unwrap();
        assert_eq!(form.instance(target).unwrap().branch, Some(0));

        form.set("/target", json!({"host": "h"})).unwrap();
        let view = form.instance(target).unwrap();
        assert_eq!(view.branch, Some(1));
        assert_eq!(view.widget, Some("group"));
        assert_eq!(form.value_at("/target/host"), Some(json!("h")));

        // The sibling kept its instance and its state.
        let sibling = form.instance(name).unwrap();
        assert!(sibling.dirty && sibling.touched);
    }

    #[test]
    fn test_reset_restores_original() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer", "default": 5},
                "b": {"type": "integer", "default": 7}
            }
        });
        let mut form = Form::new(&schema, Some(json!({"a": 1}))).unwrap();
        form.set("/a", json!(2)).unwrap();
        form.set("/b", json!(3)).unwrap();

        let a = form.find("/a").unwrap();
        form.reset(a).unwrap();
        assert_eq!(form.value_at("/a"), Some(json!(1)));
        assert!(!form.instance(a).unwrap().dirty);

        let b = form.find("/b").unwrap();
        form.reset(b).unwrap();
        assert_eq!(form.value_at("/b"), Some(json!(7)));
    }

    #[test]
    fn test_listeners_see_committed_edits() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut form = Form::new(
            &json!({"type": "object", "properties": {"on": {"type": "boolean"}}}),
            Some(json!({})),
        )
        .unwrap();
        let sink = seen.clone();
        form.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        form.set("/on", json!(true)).unwrap();
        form.set("/on", json!("maybe")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            ChangeEvent {
                path: "/on".into(),
                value: Some(json!(true)),
                valid: true,
                cause: ChangeCause::Edit,
            }
        );
    }

    #[test]
    fn test_unknown_path_and_stale_instance() {
        let schema = json!({
            "type": "object",
            "properties": {"t": {"oneOf": [{"type": "string"}, {"type": "array", "items": {"type": "integer"}}]}}
        });
        let mut form = Form::new(&schema, Some(json!({"t": [1]}))).unwrap();
        assert!(matches!(
            form.set("/nope", json!(1)).unwrap_err(),
            FormError::UnknownPath(_)
        ));
        let element = form.find("/t/0").unwrap();
        form.set("/t", json!("s")).unwrap();
        assert!(matches!(
            form.on_change(element, json!(2)).unwrap_err(),
            FormError::UnknownInstance(_)
        ));
    }
}
