use std::fmt;

use serde_json::Value;
use tokio::sync::oneshot::error::TryRecvError;

use super::{Body, ChangeCause, Form, InstanceId, Pending};
use crate::{
    schema::{SchemaKind, json_type_name},
    validator::{Issue, PendingCheck, SHAPE_KEYWORDS},
};

/// One located validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON pointer of the offending node, `""` for the root.
    pub path: String,
    pub message: String,
    pub code: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {} ({})", self.message, self.code)
    }
}

/// Whole-form validation state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationResult {
    /// No errors and no pending checks.
    pub valid: bool,
    /// Asynchronous checks still outstanding.
    pub pending: usize,
    /// Direct errors of every node, pre-order in declaration order.
    pub errors: Vec<FieldError>,
}

impl Form {
    /// Synchronous problems of one node, and the value when it got as far as
    /// the constraint checks. Children are judged through their own
    /// instances; a type mismatch skips constraint checks.
    pub(super) fn sync_issues(&mut self, id: InstanceId) -> (Vec<Issue>, Option<Value>) {
        let Some(inst) = self.inst(id) else {
            return (Vec::new(), None);
        };
        let Some(value) = self.store.to_json(inst.value) else {
            let parent_present = inst
                .parent
                .and_then(|p| self.inst(p))
                .is_some_and(|p| self.store.is_present(p.value));
            let mut issues = Vec::new();
            if inst.required && parent_present {
                issues.push(Issue::new("required", "is required"));
            }
            return (issues, None);
        };

        let mut issues = Vec::new();
        match &inst.body {
            Body::Broken(err) => issues.push(Issue::new("no_widget", err.to_string())),
            // The value below is unchecked until the node is expanded.
            Body::Deferred => issues.push(Issue::new("deferred", "not expanded yet")),
            Body::Widget(_) => {}
        }
        let node = self.schema.node(inst.resolved);
        if !node.kind.accepts_type(&value) {
            issues.push(match &node.kind {
                SchemaKind::Enum { variants } => Issue::new(
                    "enum",
                    format!("must be one of {}", Value::Array(variants.clone())),
                ),
                kind => Issue::new(
                    "type",
                    format!("expected {kind}, got {}", json_type_name(&value)),
                ),
            });
            return (issues, None);
        }
        issues.extend(self.validator.check(node, &value));

        match self.with_binding(id, |widget, binding| widget.validate(binding)) {
            Some(Ok(found)) => issues.extend(found),
            Some(Err(err)) => issues.push(Issue::new(err.code, err.message)),
            None => {}
        }
        (issues, Some(value))
    }

    /// Direct problems of one node. The asynchronous check only starts once
    /// every synchronous one passed.
    fn direct_issues(&mut self, id: InstanceId) -> (Vec<Issue>, Option<PendingCheck>) {
        let (issues, checked) = self.sync_issues(id);
        let pending = match (checked, self.inst(id)) {
            (Some(value), Some(inst)) if issues.is_empty() => self
                .validator
                .check_async(self.schema.node(inst.resolved), &value),
            _ => None,
        };
        (issues, pending)
    }

    /// Recomputes the direct result of `id` and updates its own aggregate.
    /// Returns the change in (errors, pending) for the caller to propagate.
    pub(super) fn revalidate_local(&mut self, id: InstanceId) -> (isize, isize) {
        let (issues, pending) = self.direct_issues(id);
        self.replace_direct(id, issues, pending)
    }

    /// Installs a new direct result on `id`, dropping any check it
    /// supersedes. Returns the change in (errors, pending).
    pub(super) fn replace_direct(
        &mut self,
        id: InstanceId,
        issues: Vec<Issue>,
        pending: Option<PendingCheck>,
    ) -> (isize, isize) {
        let Some(inst) = self.inst_mut(id) else {
            return (0, 0);
        };
        let delta_errors = issues.len() as isize - inst.issues.len() as isize;
        let delta_pending = pending.is_some() as isize - inst.pending.is_some() as isize;
        let stale = inst.pending.is_some();
        inst.issues = issues;
        inst.pending = pending.map(|rx| Pending { rx });
        inst.errors_below = inst.errors_below.saturating_add_signed(delta_errors);
        inst.pending_below = inst.pending_below.saturating_add_signed(delta_pending);
        let waiting = inst.pending.is_some();

        if stale {
            debug!("{}: superseding pending check", self.path_of(id));
        }
        if waiting {
            self.pending.insert(id);
        } else {
            self.pending.remove(&id);
        }
        (delta_errors, delta_pending)
    }

    /// Recomputes `id` and carries the change up to the root.
    pub(super) fn revalidate(&mut self, id: InstanceId) {
        let (delta_errors, delta_pending) = self.revalidate_local(id);
        let parent = self.inst(id).and_then(|i| i.parent);
        self.propagate(parent, delta_errors, delta_pending);
    }

    /// Re-checks the ancestors of `id` whose own result can depend on the
    /// edit. Count keywords are only re-read on `reshaped` ancestors, those
    /// that gained or lost a member; any other keyword, a problem they did
    /// not raise or a pending check always forces a re-check.
    pub(super) fn revalidate_ancestors(&mut self, id: InstanceId, reshaped: &[InstanceId]) {
        let shape = |key: &str| SHAPE_KEYWORDS.contains(&key);
        let mut cursor = self.inst(id).and_then(|i| i.parent);
        while let Some(current) = cursor {
            let Some(inst) = self.inst(current) else {
                break;
            };
            cursor = inst.parent;
            let constraints = &self.schema.node(inst.resolved).constraints;
            let content = constraints.keys().any(|k| !shape(k.as_str()))
                || inst.issues.iter().any(|i| !shape(i.code.as_str()));
            let counted = reshaped.contains(&current)
                && (!constraints.is_empty() || !inst.issues.is_empty());
            if content || counted || inst.pending.is_some() {
                self.revalidate(current);
            } else {
                trace!("{}: unaffected by the edit", self.path_of(current));
            }
        }
    }

    /// Adds a change in subtree counts to `from` and every ancestor above.
    pub(super) fn propagate(
        &mut self,
        mut cursor: Option<InstanceId>,
        delta_errors: isize,
        delta_pending: isize,
    ) {
        if delta_errors == 0 && delta_pending == 0 {
            return;
        }
        while let Some(id) = cursor {
            let Some(inst) = self.inst_mut(id) else {
                break;
            };
            inst.errors_below = inst.errors_below.saturating_add_signed(delta_errors);
            inst.pending_below = inst.pending_below.saturating_add_signed(delta_pending);
            cursor = inst.parent;
        }
    }

    /// Re-checks every node and returns the whole-form result. Instances
    /// deferred by the depth limit that hold a value are expanded first.
    pub fn validate_all(&mut self) -> ValidationResult {
        self.validate_subtree(self.root);
        let result = self.result();
        debug!(
            "validated form: {} errors, {} pending",
            result.errors.len(),
            result.pending
        );
        result
    }

    fn validate_subtree(&mut self, id: InstanceId) {
        let unexpanded = self
            .inst(id)
            .is_some_and(|i| matches!(i.body, Body::Deferred) && self.store.is_present(i.value));
        if unexpanded {
            self.rebuild(id, true);
        }
        let children = match self.inst(id) {
            Some(inst) => inst.children.clone(),
            None => return,
        };
        for child in &children {
            self.validate_subtree(*child);
        }
        let (errors, pending) = children
            .iter()
            .filter_map(|c| self.inst(*c))
            .fold((0, 0), |(e, p), c| (e + c.errors_below, p + c.pending_below));
        if let Some(inst) = self.inst_mut(id) {
            inst.errors_below = errors + inst.issues.len();
            inst.pending_below = pending + usize::from(inst.pending.is_some());
        }
        self.revalidate_local(id);
    }

    /// Current whole-form result, read from the aggregates without
    /// re-checking anything.
    pub fn result(&self) -> ValidationResult {
        let mut errors = Vec::new();
        self.collect_errors(self.root, String::new(), &mut errors);
        let pending = self.inst(self.root).map_or(0, |r| r.pending_below);
        ValidationResult {
            valid: errors.is_empty() && pending == 0,
            pending,
            errors,
        }
    }

    fn collect_errors(&self, id: InstanceId, path: String, out: &mut Vec<FieldError>) {
        let Some(inst) = self.inst(id) else {
            return;
        };
        if inst.errors_below == 0 {
            return;
        }
        out.extend(inst.issues.iter().map(|issue| FieldError {
            path: path.clone(),
            message: issue.message.clone(),
            code: issue.code.clone(),
        }));
        for child in &inst.children {
            let child_path = match self.inst(*child).and_then(|c| c.segment.as_ref()) {
                Some(segment) => format!("{path}/{segment}"),
                None => path.clone(),
            };
            self.collect_errors(*child, child_path, out);
        }
    }

    /// Root is valid: no errors anywhere and nothing pending.
    pub fn is_valid(&self) -> bool {
        self.inst(self.root)
            .is_some_and(|r| r.errors_below == 0 && r.pending_below == 0)
    }

    /// Number of asynchronous checks still outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Applies every finished asynchronous check without waiting. Returns
    /// how many resolved.
    pub fn poll_pending(&mut self) -> usize {
        let mut resolved = 0;
        let ids: Vec<InstanceId> = self.pending.iter().copied().collect();
        for id in ids {
            let outcome = match self.inst_mut(id).and_then(|i| i.pending.as_mut()) {
                Some(pending) => pending.rx.try_recv(),
                None => {
                    self.pending.remove(&id);
                    continue;
                }
            };
            match outcome {
                Ok(issues) => self.finish_pending(id, issues),
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Closed) => self.finish_pending(id, vec![dropped_check()]),
            }
            resolved += 1;
        }
        resolved
    }

    /// Waits until every outstanding asynchronous check has resolved.
    pub async fn settle(&mut self) {
        while let Some(id) = self.pending.iter().next().copied() {
            let outcome = match self.inst_mut(id).and_then(|i| i.pending.as_mut()) {
                Some(pending) => Some((&mut pending.rx).await),
                None => None,
            };
            match outcome {
                Some(Ok(issues)) => self.finish_pending(id, issues),
                Some(Err(_)) => self.finish_pending(id, vec![dropped_check()]),
                None => {
                    self.pending.remove(&id);
                }
            }
        }
    }

    fn finish_pending(&mut self, id: InstanceId, issues: Vec<Issue>) {
        self.pending.remove(&id);
        let Some(inst) = self.inst_mut(id) else {
            return;
        };
        if inst.pending.take().is_none() {
            return;
        }
        let delta_errors = issues.len() as isize;
        inst.issues.extend(issues);
        inst.errors_below += delta_errors as usize;
        inst.pending_below = inst.pending_below.saturating_sub(1);
        let parent = inst.parent;
        self.propagate(parent, delta_errors, -1);
        trace!("{}: async check resolved", self.path_of(id));
        self.notify(id, ChangeCause::Validation);
    }
}

fn dropped_check() -> Issue {
    warn!("asynchronous validator dropped a check without answering");
    Issue::new("validator", "validation did not complete")
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        schema::SchemaNode,
        validator::{BasicValidator, Validator},
    };

    #[test]
    fn test_required_and_min_length() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string", "minLength": 3}},
            "required": ["a"]
        });
        let mut form = Form::new(&schema, Some(json!({}))).unwrap();
        let result = form.result();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, "/a");
        assert_eq!(result.errors[0].code, "required");

        form.set("/a", json!("ok")).unwrap();
        let result = form.result();
        assert_eq!(result.errors[0].code, "minLength");

        form.set("/a", json!("ok!")).unwrap();
        assert!(form.is_valid());
        assert_eq!(form.value(), json!({"a": "ok!"}));
    }

    #[test]
    fn test_error_count_is_sum_of_direct_errors() {
        let schema = json!({
            "type": "object",
            "properties": {
                "list": {
                    "type": "array",
                    "minItems": 3,
                    "items": {"type": "integer", "maximum": 5}
                },
                "name": {"type": "string", "enum": ["x", "y"]}
            },
            "required": ["name"]
        });
        let form = Form::new(&schema, Some(json!({"list": [1, 7, 9], "name": "z"}))).unwrap();
        let result = form.result();
        let codes: Vec<_> = result.errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, ["maximum", "maximum", "enum"]);
        assert_eq!(result.errors[0].path, "/list/1");
        assert_eq!(form.instance(form.root()).unwrap().issues.len(), 0);
    }

    #[test]
    fn test_type_mismatch_skips_constraints() {
        let schema = json!({"type": "integer", "minimum": 10});
        let form = Form::new(&schema, Some(json!("seven"))).unwrap();
        let result = form.result();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, "type");
        assert_eq!(result.errors[0].to_string(), "/: expected integer, got string (type)");
    }

    #[test]
    fn test_lazy_validation() {
        let schema = json!({"type": "string", "minLength": 2});
        let mut form = Form::builder()
            .options(crate::form::FormOptions::default().with_eager_validation(false))
            .build(&schema, Some(json!("x")))
            .unwrap();
        assert!(form.is_valid());
        assert!(!form.validate_all().valid);
    }

    #[derive(Default)]
    struct Remote {
        senders: Mutex<Vec<oneshot::Sender<Vec<Issue>>>>,
    }

    impl Validator for Remote {
        fn check(&self, node: &SchemaNode, value: &Value) -> Vec<Issue> {
            BasicValidator::new().check(node, value)
        }

        fn check_async(&self, _node: &SchemaNode, value: &Value) -> Option<PendingCheck> {
            if !value.is_string() {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            self.senders.lock().unwrap().push(tx);
            Some(rx)
        }
    }

    /// Counts how often the root node is checked.
    #[derive(Default)]
    struct RootCounter {
        checks: AtomicUsize,
    }

    impl Validator for RootCounter {
        fn check(&self, node: &SchemaNode, value: &Value) -> Vec<Issue> {
            if node.pointer == "#" {
                self.checks.fetch_add(1, Ordering::SeqCst);
            }
            BasicValidator::new().check(node, value)
        }
    }

    #[test]
    fn test_count_keywords_recheck_only_when_members_change() {
        let counter = Arc::new(RootCounter::default());
        let schema = json!({
            "type": "object",
            "minProperties": 2,
            "properties": {
                "a": {"type": "object", "properties": {"b": {"type": "string"}}},
                "c": {"type": "integer"}
            }
        });
        let mut form = Form::builder()
            .validator(counter.clone())
            .build(&schema, Some(json!({"a": {"b": "x"}})))
            .unwrap();
        let checks = || counter.checks.load(Ordering::SeqCst);
        let initial = checks();
        assert_eq!(form.result().errors[0].code, "minProperties");

        form.set("/a/b", json!("y")).unwrap();
        assert_eq!(checks(), initial);
        assert_eq!(form.result().errors[0].code, "minProperties");

        form.set("/c", json!(1)).unwrap();
        assert_eq!(checks(), initial + 1);
        assert!(form.is_valid());

        form.reset(form.find("/c").unwrap()).unwrap();
        assert_eq!(checks(), initial + 2);
        assert_eq!(form.result().errors[0].code, "minProperties");
    }

    #[test]
    fn test_value_keywords_recheck_on_deep_edit() {
        let schema = json!({
            "type": "array",
            "uniqueItems": true,
            "items": {"type": "string"}
        });
        let mut form = Form::new(&schema, Some(json!(["a", "b"]))).unwrap();
        assert!(form.is_valid());
        form.set("/1", json!("a")).unwrap();
        assert_eq!(form.result().errors[0].code, "uniqueItems");
        form.set("/1", json!("c")).unwrap();
        assert!(form.is_valid());
    }

    #[test]
    fn test_pending_blocks_validity_until_resolved() {
        let remote = Arc::new(Remote::default());
        let mut form = Form::builder()
            .validator(remote.clone())
            .build(&json!({"type": "string"}), Some(json!("taken")))
            .unwrap();
        assert!(!form.is_valid());
        assert_eq!(form.result().pending, 1);
        assert_eq!(form.poll_pending(), 0);

        let tx = remote.senders.lock().unwrap().pop().unwrap();
        tx.send(vec![Issue::new("unique", "already taken")]).unwrap();
        assert_eq!(form.poll_pending(), 1);
        let result = form.result();
        assert_eq!(result.pending, 0);
        assert_eq!(result.errors[0].code, "unique");
    }

    #[test]
    fn test_rejected_input_starts_no_check() {
        let remote = Arc::new(Remote::default());
        let mut form = Form::builder()
            .validator(remote.clone())
            .build(&json!({"type": "string"}), Some(json!("a")))
            .unwrap();
        assert_eq!(form.pending_count(), 1);

        form.on_change(form.root(), json!(true)).unwrap();
        assert_eq!(form.pending_count(), 0);
        assert_eq!(remote.senders.lock().unwrap().len(), 1);
        let result = form.result();
        assert_eq!(result.pending, 0);
        let codes: Vec<_> = result.errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, ["input"]);
        assert_eq!(form.value(), json!("a"));
    }

    #[test]
    fn test_new_edit_supersedes_pending_check() {
        let remote = Arc::new(Remote::default());
        let mut form = Form::builder()
            .validator(remote.clone())
            .build(&json!({"type": "string"}), Some(json!("a")))
            .unwrap();
        form.set("", json!("b")).unwrap();
        let mut senders = std::mem::take(&mut *remote.senders.lock().unwrap());
        assert_eq!(senders.len(), 2);
        let latest = senders.pop().unwrap();
        let stale = senders.pop().unwrap();

        // The first receiver was dropped by the second edit.
        assert!(stale.send(vec![Issue::new("unique", "stale")]).is_err());
        latest.send(Vec::new()).unwrap();
        tokio_test::block_on(form.settle());
        assert!(form.is_valid());
    }
}
