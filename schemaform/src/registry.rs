//! Widget registry: resolved semantic type to widget implementation.
//!
//! Registrations are last-wins: registering a widget for a kind that already
//! has one replaces it. A fallback (typically the raw JSON editor) covers
//! kinds without a registration.

use std::{collections::HashMap, sync::Arc};

use crate::{
    error::NoWidgetError,
    widget::{
        Widget, WidgetKind,
        builtin::{
            CheckboxWidget, GroupWidget, ListWidget, NullWidget, NumberWidget, RawJsonWidget,
            SelectWidget, TextWidget,
        },
    },
};

/// Constructor for a fresh widget instance.
pub type WidgetFactory = Arc<dyn Fn() -> Box<dyn Widget> + Send + Sync>;

/// Map from widget kind to factory, plus an optional fallback.
#[derive(Clone, Default)]
pub struct Registry {
    widgets: HashMap<WidgetKind, WidgetFactory>,
    fallback: Option<WidgetFactory>,
}

impl Registry {
    /// Empty registry without fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock widgets and the raw JSON fallback.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(WidgetKind::Boolean, || Box::new(CheckboxWidget::default()))
            .register(WidgetKind::String, || Box::new(TextWidget::default()))
            .register(WidgetKind::Number, || Box::new(NumberWidget::number()))
            .register(WidgetKind::Integer, || Box::new(NumberWidget::integer()))
            .register(WidgetKind::Enum, || Box::new(SelectWidget::default()))
            .register(WidgetKind::Null, || Box::new(NullWidget))
            .register(WidgetKind::Object, || Box::new(GroupWidget::default()))
            .register(WidgetKind::Array, || Box::new(ListWidget::default()))
            .register(WidgetKind::Any, || Box::new(RawJsonWidget::default()))
            .set_fallback(|| Box::new(RawJsonWidget::default()));
        registry
    }

    /// Registers `factory` for `kind`, replacing any earlier registration.
    pub fn register<F>(&mut self, kind: WidgetKind, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Widget> + Send + Sync + 'static,
    {
        if self.widgets.insert(kind, Arc::new(factory)).is_some() {
            debug!("widget for `{kind}` overridden");
        }
        self
    }

    /// Builder-style [`Registry::register`].
    pub fn with<F>(mut self, kind: WidgetKind, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Widget> + Send + Sync + 'static,
    {
        self.register(kind, factory);
        self
    }

    /// Widget used when a kind has no registration.
    pub fn set_fallback<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Widget> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(factory));
        self
    }

    pub fn clear_fallback(&mut self) -> &mut Self {
        self.fallback = None;
        self
    }

    pub fn contains(&self, kind: WidgetKind) -> bool {
        self.widgets.contains_key(&kind)
    }

    /// Instantiates the widget registered for `kind`, without fallback.
    ///
    /// # Errors
    ///
    /// [`NoWidgetError`] when nothing is registered for `kind`.
    pub fn create(&self, kind: WidgetKind) -> Result<Box<dyn Widget>, NoWidgetError> {
        self.widgets
            .get(&kind)
            .map(|factory| factory())
            .ok_or(NoWidgetError { kind })
    }

    /// Instantiates the widget for `kind`, using the fallback if needed.
    ///
    /// # Errors
    ///
    /// [`NoWidgetError`] when neither a registration nor a fallback exists.
    pub fn create_or_fallback(&self, kind: WidgetKind) -> Result<Box<dyn Widget>, NoWidgetError> {
        self.create(kind).or_else(|err| match &self.fallback {
            Some(fallback) => {
                warn!("{err}, using fallback widget");
                Ok(fallback())
            }
            None => Err(err),
        })
    }
}
