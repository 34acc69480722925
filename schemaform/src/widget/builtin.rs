//! Stock widgets: checkbox, text, number, integer, select, null, object
//! group, array list and a raw JSON fallback.
//!
//! Inputs are normalised the way a terminal form receives them: a checkbox
//! accepts `"true"`/`"false"`, numeric fields accept numeric strings, a
//! select accepts either a variant or its index.

use serde_json::{Number, Value};

use super::{Binding, Widget};
use crate::{error::WidgetError, schema::json_type_name};

fn mismatch(expected: &str, input: &Value) -> WidgetError {
    WidgetError::new(
        "input",
        format!("expected {expected}, got {}", json_type_name(input)),
    )
}

/// Checkbox for booleans.
#[derive(Debug, Default, Clone)]
pub struct CheckboxWidget {
    checked: bool,
    label: String,
}

impl Widget for CheckboxWidget {
    fn name(&self) -> &'static str {
        "checkbox"
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.checked = binding.shown().and_then(Value::as_bool).unwrap_or(false);
        self.label = binding.label().to_string();
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        let checked = match &input {
            Value::Bool(b) => *b,
            Value::String(s) => match s.trim() {
                "true" | "yes" | "on" => true,
                "false" | "no" | "off" => false,
                _ => return Err(mismatch("a boolean", &input)),
            },
            _ => return Err(mismatch("a boolean", &input)),
        };
        self.checked = checked;
        Ok(Value::Bool(checked))
    }

    fn render(&self) -> String {
        let mark = if self.checked { "x" } else { " " };
        format!("[{mark}] {}", self.label)
    }
}

/// Single-line text input.
#[derive(Debug, Default, Clone)]
pub struct TextWidget {
    text: Option<String>,
}

impl Widget for TextWidget {
    fn name(&self) -> &'static str {
        "text"
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.text = binding.shown().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        match input {
            Value::String(s) => {
                self.text = Some(s.clone());
                Ok(Value::String(s))
            }
            Value::Number(n) => {
                self.text = Some(n.to_string());
                Ok(Value::String(n.to_string()))
            }
            other => Err(mismatch("text", &other)),
        }
    }

    fn render(&self) -> String {
        match &self.text {
            Some(text) => format!("{text:?}"),
            None => "<empty>".to_string(),
        }
    }
}

/// Numeric input; `integer` restricts to whole numbers.
#[derive(Debug, Default, Clone)]
pub struct NumberWidget {
    integer: bool,
    current: Option<Number>,
}

impl NumberWidget {
    pub fn number() -> Self {
        Self::default()
    }

    pub fn integer() -> Self {
        Self {
            integer: true,
            current: None,
        }
    }

    fn parse(&self, input: &Value) -> Result<Number, WidgetError> {
        let expected = if self.integer { "an integer" } else { "a number" };
        match input {
            Value::Number(n) => {
                if self.integer && !crate::schema::is_integer(input) {
                    return Err(mismatch(expected, input));
                }
                Ok(n.clone())
            }
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(Number::from(i));
                }
                if self.integer {
                    return Err(WidgetError::new("input", format!("`{s}` is not an integer")));
                }
                s.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .ok_or_else(|| WidgetError::new("input", format!("`{s}` is not a number")))
            }
            other => Err(mismatch(expected, other)),
        }
    }
}

impl Widget for NumberWidget {
    fn name(&self) -> &'static str {
        if self.integer { "integer" } else { "number" }
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.current = match binding.shown() {
            Some(Value::Number(n)) => Some(n.clone()),
            _ => None,
        };
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        let n = self.parse(&input)?;
        self.current = Some(n.clone());
        Ok(Value::Number(n))
    }

    fn render(&self) -> String {
        match &self.current {
            Some(n) => n.to_string(),
            None => "<unset>".to_string(),
        }
    }
}

/// Select among enum variants.
#[derive(Debug, Default, Clone)]
pub struct SelectWidget {
    variants: Vec<Value>,
    selected: Option<usize>,
}

impl Widget for SelectWidget {
    fn name(&self) -> &'static str {
        "select"
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.variants = match &binding.schema.kind {
            crate::schema::SchemaKind::Enum { variants } => variants.clone(),
            _ => Vec::new(),
        };
        self.selected = binding
            .shown()
            .and_then(|v| self.variants.iter().position(|x| x == v));
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        if let Some(idx) = self.variants.iter().position(|v| *v == input) {
            self.selected = Some(idx);
            return Ok(input);
        }
        // Numeric input selects by index unless numbers are variants.
        if let Some(idx) = input.as_u64().and_then(|i| usize::try_from(i).ok())
            && !self.variants.iter().any(Value::is_number)
        {
            return match self.variants.get(idx) {
                Some(variant) => {
                    self.selected = Some(idx);
                    Ok(variant.clone())
                }
                None => Err(WidgetError::new(
                    "input",
                    format!("index {idx} out of range 0-{}", self.variants.len().saturating_sub(1)),
                )),
            };
        }
        Err(WidgetError::new(
            "input",
            format!("`{input}` is not one of {}", Value::Array(self.variants.clone())),
        ))
    }

    fn render(&self) -> String {
        match self.selected.and_then(|i| self.variants.get(i)) {
            Some(v) => format!("<{v}>"),
            None => format!("<choose 1 of {}>", self.variants.len()),
        }
    }
}

/// Placeholder for `null`-typed nodes.
#[derive(Debug, Default, Clone)]
pub struct NullWidget;

impl Widget for NullWidget {
    fn name(&self) -> &'static str {
        "null"
    }

    fn bind(&mut self, _binding: &Binding<'_>) {}

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        match input {
            Value::Null => Ok(Value::Null),
            other => Err(mismatch("null", &other)),
        }
    }

    fn render(&self) -> String {
        "null".to_string()
    }
}

/// Group header for object nodes. Children render themselves.
#[derive(Debug, Default, Clone)]
pub struct GroupWidget {
    title: String,
    fields: usize,
    edits: usize,
}

impl Widget for GroupWidget {
    fn name(&self) -> &'static str {
        "group"
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.title = binding.label().to_string();
        self.fields = match &binding.schema.kind {
            crate::schema::SchemaKind::Object { properties, .. } => properties.len(),
            _ => 0,
        };
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        match input {
            Value::Object(_) => Ok(input),
            other => Err(mismatch("an object", &other)),
        }
    }

    fn on_child_change(&mut self, _path: &str) {
        self.edits += 1;
    }

    fn render(&self) -> String {
        let title = if self.title.is_empty() { "{}" } else { &self.title };
        match self.edits {
            0 => format!("{title} ({} fields)", self.fields),
            n => format!("{title} ({} fields, {n} edits)", self.fields),
        }
    }
}

/// List header for array nodes.
#[derive(Debug, Default, Clone)]
pub struct ListWidget {
    len: usize,
}

impl Widget for ListWidget {
    fn name(&self) -> &'static str {
        "list"
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.len = binding.value.and_then(Value::as_array).map_or(0, Vec::len);
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        match input {
            Value::Array(items) => {
                self.len = items.len();
                Ok(Value::Array(items))
            }
            other => Err(mismatch("an array", &other)),
        }
    }

    fn render(&self) -> String {
        format!("[{} items]", self.len)
    }
}

/// Raw JSON editor; accepts any value. Used as the registry fallback.
#[derive(Debug, Default, Clone)]
pub struct RawJsonWidget {
    current: Option<Value>,
}

impl Widget for RawJsonWidget {
    fn name(&self) -> &'static str {
        "raw-json"
    }

    fn bind(&mut self, binding: &Binding<'_>) {
        self.current = binding.value.cloned();
    }

    fn on_change(&mut self, _binding: &Binding<'_>, input: Value) -> Result<Value, WidgetError> {
        self.current = Some(input.clone());
        Ok(input)
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn render(&self) -> String {
        match &self.current {
            Some(v) => v.to_string(),
            None => "<absent>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaKind, SchemaNode};
    use serde_json::json;

    fn binding<'a>(schema: &'a SchemaNode, value: Option<&'a Value>) -> Binding<'a> {
        Binding {
            path: "/field",
            schema,
            value,
            placeholder: schema.default.as_ref(),
            required: false,
            dirty: false,
            touched: false,
        }
    }

    #[test]
    fn test_checkbox() {
        let mut schema = SchemaNode::new("#", SchemaKind::Boolean);
        schema.default = Some(json!(false));
        let mut w = CheckboxWidget::default();
        w.bind(&binding(&schema, None));
        assert_eq!(w.render(), "[ ] field");

        let b = binding(&schema, None);
        assert_eq!(w.on_change(&b, json!("on")).unwrap(), json!(true));
        assert_eq!(w.render(), "[x] field");
        assert!(w.on_change(&b, json!(1)).is_err());
    }

    #[test]
    fn test_number_parsing() {
        let schema = SchemaNode::new("#", SchemaKind::Integer);
        let b = binding(&schema, None);
        let mut w = NumberWidget::integer();
        assert_eq!(w.on_change(&b, json!(" 42 ")).unwrap(), json!(42));
        assert!(w.on_change(&b, json!("4.5")).is_err());
        assert!(w.on_change(&b, json!(4.5)).is_err());

        let mut w = NumberWidget::number();
        assert_eq!(w.on_change(&b, json!("4.5")).unwrap(), json!(4.5));
        assert_eq!(w.render(), "4.5");
    }

    #[test]
    fn test_select_by_value_and_index() {
        let schema = SchemaNode::new(
            "#",
            SchemaKind::Enum {
                variants: vec![json!("a"), json!("b")],
            },
        );
        let value = json!("b");
        let mut w = SelectWidget::default();
        w.bind(&binding(&schema, Some(&value)));
        assert_eq!(w.render(), "<\"b\">");

        let b = binding(&schema, Some(&value));
        assert_eq!(w.on_change(&b, json!(0)).unwrap(), json!("a"));
        assert_eq!(w.on_change(&b, json!("b")).unwrap(), json!("b"));
        assert!(w.on_change(&b, json!(5)).is_err());
        assert!(w.on_change(&b, json!(u64::MAX)).is_err());
        assert!(w.on_change(&b, json!("c")).is_err());
    }

    #[test]
    fn test_composites_reject_scalars() {
        let schema = SchemaNode::new("#", SchemaKind::Any);
        let b = binding(&schema, None);
        assert!(GroupWidget::default().on_change(&b, json!(1)).is_err());
        assert!(ListWidget::default().on_change(&b, json!({})).is_err());
        assert_eq!(
            RawJsonWidget::default().on_change(&b, json!({"k": 1})).unwrap(),
            json!({"k": 1})
        );
    }
}
