//! Render tree, dispatcher and validation aggregation.
//!
//! A [`Form`] owns the parsed [`Schema`], the [`ValueStore`] and a tree of
//! widget instances mirroring the schema. Instances are kept in an arena and
//! addressed by [`InstanceId`]; each one records its parent for routing
//! change events upwards, never for ownership.
//!
//! ## Submodules
//!
//! - `dispatch` - branch resolution and (re)building of instance subtrees
//! - `edit` - user-facing mutations and change notification
//! - `aggregate` - per-node validation and bottom-up aggregation

use std::{collections::BTreeSet, fmt, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::{BindingError, FormError, NoWidgetError, SchemaError},
    registry::Registry,
    schema::{Schema, SchemaId, SchemaNode},
    validator::{BasicValidator, Issue, PendingCheck, Validator},
    value::{ValueId, ValueStore},
    widget::{Binding, Widget, WidgetKind},
};

mod aggregate;
mod dispatch;
mod edit;

pub use aggregate::{FieldError, ValidationResult};
pub use edit::{ChangeCause, ChangeEvent, ChangeListener};

/// Identity of a widget instance. Ids are never reused, so an id whose
/// subtree was rebuilt or removed is reported as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(usize);

impl InstanceId {
    pub(crate) fn new(idx: usize) -> Self {
        Self(idx)
    }
}

/// Position of an instance under its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(&crate::schema::escape_pointer(key)),
            Segment::Index(idx) => write!(f, "{idx}"),
        }
    }
}

/// Engine behaviour knobs.
#[derive(Debug, Clone)]
pub struct FormOptions {
    /// Validate the whole tree while building it.
    pub eager_validation: bool,
    /// Instances deeper than this are left deferred.
    pub max_depth: usize,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            eager_validation: true,
            max_depth: 64,
        }
    }
}

impl FormOptions {
    pub fn with_eager_validation(mut self, eager: bool) -> Self {
        self.eager_validation = eager;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

pub(crate) enum Body {
    Widget(Box<dyn Widget>),
    /// Recursion stopped here; expands on demand.
    Deferred,
    /// No widget available for the resolved kind.
    Broken(NoWidgetError),
}

pub(crate) struct Pending {
    rx: PendingCheck,
}

pub(crate) struct Instance {
    /// Declared schema node.
    schema: SchemaId,
    /// Effective node after references and alternatives.
    resolved: SchemaId,
    /// Active branch of the outermost `oneOf`/`anyOf`, if any.
    branch: Option<usize>,
    kind: WidgetKind,
    value: ValueId,
    parent: Option<InstanceId>,
    segment: Option<Segment>,
    required: bool,
    depth: usize,
    children: Vec<InstanceId>,
    body: Body,
    /// Settled direct issues of this node.
    issues: Vec<Issue>,
    pending: Option<Pending>,
    /// Error count of the subtree, this node included.
    errors_below: usize,
    /// Pending checks in the subtree, this node included.
    pending_below: usize,
}

/// Read-only view of one instance.
#[derive(Debug, Clone)]
pub struct InstanceView<'a> {
    pub id: InstanceId,
    pub path: String,
    pub kind: WidgetKind,
    /// Widget name, `None` for deferred or broken instances.
    pub widget: Option<&'static str>,
    pub branch: Option<usize>,
    pub deferred: bool,
    pub required: bool,
    pub schema: &'a SchemaNode,
    pub value: Option<Value>,
    pub dirty: bool,
    pub touched: bool,
    pub issues: &'a [Issue],
    pub pending: bool,
    pub children: &'a [InstanceId],
}

/// Builder for [`Form`].
pub struct FormBuilder {
    registry: Registry,
    validator: Arc<dyn Validator>,
    options: FormOptions,
}

impl Default for FormBuilder {
    fn default() -> Self {
        Self {
            registry: Registry::builtin(),
            validator: Arc::new(BasicValidator::new()),
            options: FormOptions::default(),
        }
    }
}

impl FormBuilder {
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn options(mut self, options: FormOptions) -> Self {
        self.options = options;
        self
    }

    /// Parses `schema` and builds the form.
    ///
    /// # Errors
    ///
    /// [`SchemaError`] when the schema is malformed; nothing is rendered.
    pub fn build(self, schema: &Value, initial: Option<Value>) -> Result<Form, SchemaError> {
        let schema = Schema::parse(schema)?;
        Ok(self.build_with_schema(schema, initial))
    }

    /// Builds the form from an already parsed schema.
    pub fn build_with_schema(self, schema: Schema, initial: Option<Value>) -> Form {
        let seed = match initial {
            Some(value) => Some(value),
            None => dispatch::defaults_document(&schema),
        };
        let store = ValueStore::new(seed.as_ref());
        let eager = self.options.eager_validation;
        let mut form = Form {
            schema,
            store,
            registry: self.registry,
            validator: self.validator,
            options: self.options,
            instances: Vec::new(),
            root: InstanceId(0),
            listeners: Vec::new(),
            binding_errors: Vec::new(),
            pending: BTreeSet::new(),
            validate_on_dispatch: eager,
        };
        let root_schema = form.schema.root();
        let root_value = form.store.root();
        form.root = form.alloc(root_schema, root_value, None, None, false, 0);
        form.populate(form.root, &mut Vec::new(), false);
        form.validate_on_dispatch = true;
        info!(
            "form built: {} instances, valid: {}",
            form.instances.iter().flatten().count(),
            form.is_valid()
        );
        form
    }
}

/// A schema-driven form: schema, value store and widget instance tree.
pub struct Form {
    schema: Schema,
    store: ValueStore,
    registry: Registry,
    validator: Arc<dyn Validator>,
    options: FormOptions,
    instances: Vec<Option<Instance>>,
    root: InstanceId,
    listeners: Vec<ChangeListener>,
    binding_errors: Vec<BindingError>,
    /// Instances waiting on an asynchronous check.
    pending: BTreeSet<InstanceId>,
    /// Off only while building lazily; later dispatches always validate.
    validate_on_dispatch: bool,
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Form")
            .field("root", &self.root)
            .field("instances", &self.instances.iter().flatten().count())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Form {
    pub fn builder() -> FormBuilder {
        FormBuilder::default()
    }

    /// Builds a form from explicit collaborators.
    ///
    /// # Errors
    ///
    /// [`SchemaError`] when the schema is malformed.
    pub fn build(
        schema: &Value,
        initial: Option<Value>,
        registry: Registry,
        validator: Arc<dyn Validator>,
        options: FormOptions,
    ) -> Result<Self, SchemaError> {
        Self::builder()
            .registry(registry)
            .validator(validator)
            .options(options)
            .build(schema, initial)
    }

    /// Builds a form with the stock widgets and validator.
    ///
    /// # Errors
    ///
    /// [`SchemaError`] when the schema is malformed.
    pub fn new(schema: &Value, initial: Option<Value>) -> Result<Self, SchemaError> {
        Self::builder().build(schema, initial)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn options(&self) -> &FormOptions {
        &self.options
    }

    pub fn root(&self) -> InstanceId {
        self.root
    }

    /// Current value of the whole form, `Value::Null` when the root is
    /// absent.
    pub fn value(&self) -> Value {
        self.store.to_json(self.store.root()).unwrap_or(Value::Null)
    }

    /// Current value at a JSON pointer, `None` when absent or unknown.
    pub fn value_at(&self, pointer: &str) -> Option<Value> {
        let id = self.find(pointer)?;
        self.store.to_json(self.inst(id)?.value)
    }

    /// Deserializes the current value into a typed config.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the value does not fit `C`.
    pub fn to_typed<C: DeserializeOwned>(&self) -> Result<C, FormError> {
        Ok(serde_json::from_value(self.value())?)
    }

    /// Containers that had to be coerced while binding.
    pub fn binding_errors(&self) -> &[BindingError] {
        &self.binding_errors
    }

    /// Whether anything changed since load.
    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty_deep(self.store.root())
    }

    /// Whether the user interacted with any widget.
    pub fn is_touched(&self) -> bool {
        self.store.is_touched_deep(self.store.root())
    }

    pub fn instance(&self, id: InstanceId) -> Option<InstanceView<'_>> {
        let inst = self.inst(id)?;
        let node = self.store.get(inst.value);
        Some(InstanceView {
            id,
            path: self.path_of(id),
            kind: inst.kind,
            widget: match &inst.body {
                Body::Widget(w) => Some(w.name()),
                _ => None,
            },
            branch: inst.branch,
            deferred: matches!(inst.body, Body::Deferred),
            required: inst.required,
            schema: self.schema.node(inst.resolved),
            value: self.store.to_json(inst.value),
            dirty: node.is_some_and(|n| n.is_dirty()),
            touched: node.is_some_and(|n| n.is_touched()),
            issues: &inst.issues,
            pending: inst.pending.is_some(),
            children: &inst.children,
        })
    }

    /// Instance at a JSON pointer (`""` is the root). Deferred instances are
    /// not looked through; see [`Form::expand`].
    pub fn find(&self, pointer: &str) -> Option<InstanceId> {
        let mut current = self.root;
        for segment in split_pointer(pointer)? {
            current = self.child_at(current, &segment)?;
        }
        Some(current)
    }

    fn child_at(&self, id: InstanceId, segment: &str) -> Option<InstanceId> {
        self.inst(id)?.children.iter().copied().find(|child| {
            self.inst(*child)
                .and_then(|c| c.segment.as_ref())
                .is_some_and(|s| match s {
                    Segment::Key(key) => key == segment,
                    Segment::Index(idx) => segment.parse::<usize>().ok() == Some(*idx),
                })
        })
    }

    /// JSON pointer of an instance.
    pub fn path_of(&self, id: InstanceId) -> String {
        let mut segments = Vec::new();
        let mut cursor = self.inst(id);
        while let Some(inst) = cursor {
            if let Some(segment) = &inst.segment {
                segments.push(segment.to_string());
            }
            cursor = inst.parent.and_then(|p| self.inst(p));
        }
        segments.iter().rev().map(|s| format!("/{s}")).collect()
    }

    /// Text rendering of the instance tree, one line per instance.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(self.root, &mut out);
        out
    }

    fn render_into(&self, id: InstanceId, out: &mut String) {
        let Some(inst) = self.inst(id) else {
            return;
        };
        let label = match &inst.segment {
            Some(segment) => segment.to_string(),
            None => "(root)".to_string(),
        };
        let body = match &inst.body {
            Body::Widget(w) => w.render(),
            Body::Deferred => format!("... ({} deferred)", inst.kind),
            Body::Broken(err) => format!("<{err}>"),
        };
        let mut line = format!("{}{label}: {body}", "  ".repeat(inst.depth));
        if self.store.get(inst.value).is_some_and(|n| n.is_dirty()) {
            line.push_str(" *");
        }
        if inst.pending.is_some() {
            line.push_str(" (checking)");
        }
        for issue in &inst.issues {
            line.push_str(&format!(" !{}", issue.message));
        }
        out.push_str(&line);
        out.push('\n');
        for child in &inst.children {
            self.render_into(*child, out);
        }
    }

    pub(crate) fn inst(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn inst_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(id.0).and_then(Option::as_mut)
    }

    fn checked(&self, id: InstanceId) -> Result<&Instance, FormError> {
        self.inst(id).ok_or(FormError::UnknownInstance(id))
    }

    /// Builds the binding handed to the widget of `id`.
    fn with_binding<R>(
        &mut self,
        id: InstanceId,
        f: impl FnOnce(&mut dyn Widget, &Binding<'_>) -> R,
    ) -> Option<R> {
        let path = self.path_of(id);
        let inst = self.instances.get_mut(id.0).and_then(Option::as_mut)?;
        let Body::Widget(widget) = &mut inst.body else {
            return None;
        };
        let value = self.store.to_json(inst.value);
        let node = self.store.get(inst.value);
        let schema = self.schema.node(inst.resolved);
        let binding = Binding {
            path: &path,
            schema,
            value: value.as_ref(),
            placeholder: self.schema.default_of(inst.schema),
            required: inst.required,
            dirty: node.is_some_and(|n| n.is_dirty()),
            touched: node.is_some_and(|n| n.is_touched()),
        };
        Some(f(widget.as_mut(), &binding))
    }

    /// Registers a listener fired after every committed edit.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }
}

/// Splits a JSON pointer into unescaped segments.
fn split_pointer(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() || pointer == "/" {
        return Some(Vec::new());
    }
    let rest = pointer.strip_prefix('/')?;
    Some(
        rest.split('/')
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect(),
    )
}
