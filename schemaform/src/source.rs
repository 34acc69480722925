//! Schema and value documents on disk, and forms for typed configs.

use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, bail};
use schemars::JsonSchema;
use serde_json::Value;

use crate::form::{Form, FormBuilder};

/// File formats understood for value documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Toml,
}

impl Format {
    /// Format chosen by file extension.
    ///
    /// # Errors
    ///
    /// Fails for extensions other than `json`, `toml` and `tml`.
    pub fn of(path: &Path) -> anyhow::Result<Self> {
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match ext {
            "json" => Ok(Format::Json),
            "toml" | "tml" => Ok(Format::Toml),
            _ => bail!("Unsupported config file extension: {ext:?}"),
        }
    }

    /// Parses document text into JSON.
    ///
    /// # Errors
    ///
    /// Returns the parse error of the underlying format.
    pub fn parse(self, content: &str) -> anyhow::Result<Value> {
        Ok(match self {
            Format::Json => serde_json::from_str(content)?,
            Format::Toml => {
                let v: toml::Value = toml::from_str(content)?;
                serde_json::to_value(v)?
            }
        })
    }

    /// Pretty-prints a value in this format.
    ///
    /// # Errors
    ///
    /// TOML cannot represent `null` or a non-table root.
    pub fn render(self, value: &Value) -> anyhow::Result<String> {
        Ok(match self {
            Format::Json => serde_json::to_string_pretty(value)?,
            Format::Toml => toml::to_string_pretty(value)?,
        })
    }
}

/// Derive a default schema path from a value path:
/// `dir/config.toml` becomes `dir/config-schema.json`.
pub fn default_schema_by_init(config: &Path) -> PathBuf {
    let file_name = config
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name_split = file_name.split('.').collect::<Vec<_>>();
    if name_split.len() > 1 {
        name_split.pop();
    }

    let name = format!("{}-schema.json", name_split.join("."));

    match config.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Reads a JSON schema document.
///
/// # Errors
///
/// Fails when the file is missing or not valid JSON.
pub fn load_schema(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        bail!("Schema file does not exist: {}", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid schema {}", path.display()))
}

/// Reads a value document; `None` when the file is missing or blank.
///
/// # Errors
///
/// Fails on unreadable files, unknown extensions and parse errors.
pub fn load_value(path: &Path) -> anyhow::Result<Option<Value>> {
    let format = Format::of(path)?;
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let value = format
        .parse(&content)
        .with_context(|| format!("Invalid value document {}", path.display()))?;
    Ok(Some(value))
}

/// Loads a value document and its schema (derived from the value path when
/// not given) and builds the form.
///
/// # Errors
///
/// Fails on I/O, parse and schema errors.
pub fn open(
    value_path: &Path,
    schema_path: Option<&Path>,
    builder: FormBuilder,
) -> anyhow::Result<Form> {
    let schema_path = match schema_path {
        Some(path) => path.to_path_buf(),
        None => default_schema_by_init(value_path),
    };
    let schema = load_schema(&schema_path)?;
    let initial = load_value(value_path)?;
    info!(
        "loaded {} with schema {}",
        value_path.display(),
        schema_path.display()
    );
    let form = builder
        .build(&schema, initial)
        .with_context(|| format!("Invalid schema {}", schema_path.display()))?;
    Ok(form)
}

/// Writes the form's value, keeping a timestamped backup of an existing
/// file next to it.
///
/// # Errors
///
/// Fails on I/O errors and values the target format cannot hold.
pub fn save(form: &Form, path: &Path) -> anyhow::Result<()> {
    let format = Format::of(path)?;
    let content = format.render(&form.value())?;

    if path.exists() {
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let bk = format!(
            "bk-{:?}.{ext}",
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)?
                .as_secs()
        );
        let backup_path = path.with_extension(bk);
        fs::copy(path, &backup_path)
            .with_context(|| format!("Failed to back up {}", path.display()))?;
        debug!("backup written to {}", backup_path.display());
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Builds a form from the schema generated for a Rust config type.
///
/// # Errors
///
/// Fails when the generated schema cannot be serialized or parsed.
pub fn form_for<C: JsonSchema>(initial: Option<Value>) -> anyhow::Result<Form> {
    let schema = schemars::schema_for!(C);
    let schema_json = serde_json::to_value(&schema)?;
    let form = Form::new(&schema_json, initial)?;
    Ok(form)
}
