use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use schemaform::{Form, source};

/// Check and edit JSON/TOML documents against a JSON Schema.
#[derive(Parser, Debug)]
#[command(name = "schemaform", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a document and list every error.
    Check {
        /// Value document (`.json` or `.toml`).
        value: PathBuf,
        /// Schema file; defaults to `<value stem>-schema.json`.
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },
    /// Print the widget tree built for a document.
    Show {
        value: PathBuf,
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },
    /// Apply one edit and report the resulting validity.
    Set {
        value: PathBuf,
        /// JSON pointer of the field to edit, e.g. `/server/port`.
        #[arg(short, long)]
        path: String,
        /// New value as JSON; bare words are taken as strings.
        #[arg(short, long)]
        json: String,
        #[arg(short, long)]
        schema: Option<PathBuf>,
        /// Save the edited document (a backup of the old one is kept).
        #[arg(short, long)]
        write: bool,
    },
}

fn open(value: &Path, schema: Option<&Path>) -> anyhow::Result<Form> {
    let mut form = source::open(value, schema, Form::builder())?;
    form.poll_pending();
    Ok(form)
}

fn report(form: &Form) -> bool {
    for err in form.binding_errors() {
        eprintln!("warning: {err}");
    }
    let result = form.result();
    for err in &result.errors {
        println!("{err}");
    }
    if result.pending > 0 {
        println!("{} check(s) still pending", result.pending);
    }
    result.valid
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Check { value, schema } => {
            let form = open(&value, schema.as_deref())?;
            let valid = report(&form);
            if valid {
                println!("{}: valid", value.display());
            }
            Ok(valid)
        }
        Commands::Show { value, schema } => {
            let form = open(&value, schema.as_deref())?;
            print!("{}", form.render());
            Ok(form.is_valid())
        }
        Commands::Set {
            value,
            path,
            json,
            schema,
            write,
        } => {
            let mut form = open(&value, schema.as_deref())?;
            let input = serde_json::from_str(&json)
                .unwrap_or_else(|_| serde_json::Value::String(json.clone()));
            form.set(&path, input)
                .with_context(|| format!("Failed to set {path}"))?;
            form.poll_pending();
            let valid = report(&form);
            println!("{path} = {}", form.value_at(&path).unwrap_or_default());
            if write {
                source::save(&form, &value)?;
                info!("saved {}", value.display());
            }
            Ok(valid)
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
