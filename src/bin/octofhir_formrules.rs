// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line interface for inspecting and simulating form configurations

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use octofhir_formrules::collector::RuleCategory;
use octofhir_formrules::diagnostics::{DiagnosticFormatter, Format};
use octofhir_formrules::{
    EngineConfig, EvaluationScope, FormConfig, FormEngine, RuleEntry, SchemaRegistry,
    extract_expression_dependencies, parse,
};
use serde_json::Value;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "octofhir-formrules")]
#[command(about = "Inspect, evaluate and simulate cross-field form rules")]
#[command(version)]
#[command(author = "OctoFHIR Team <funyloony@gmail.com>")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect and classify the rules of a form configuration
    Check {
        /// Form configuration JSON ("-" for stdin)
        config: PathBuf,
        /// Schema registry JSON (name -> definition)
        #[arg(short, long)]
        schemas: Option<PathBuf>,
        /// Print the collected rules as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the dependencies of an expression
    Deps {
        /// Expression source
        expression: String,
    },
    /// Evaluate an expression
    Eval {
        /// Expression source
        expression: String,
        /// Form value as JSON
        #[arg(long, default_value = "{}")]
        form: String,
        /// Field value as JSON
        #[arg(long, default_value = "null")]
        field_value: String,
        /// External data as JSON
        #[arg(long, default_value = "null")]
        external: String,
    },
    /// Build a form, apply user edits and print the field states
    Simulate {
        /// Form configuration JSON ("-" for stdin)
        config: PathBuf,
        /// Schema registry JSON (name -> definition)
        #[arg(short, long)]
        schemas: Option<PathBuf>,
        /// User edit as path=json, applied in order
        #[arg(long = "set", value_name = "PATH=JSON")]
        edits: Vec<String>,
        /// Build even when rules fail to install
        #[arg(long)]
        lenient: bool,
    },
}

#[tokio::main]
async fn main() {
    human_panic::setup_panic!();
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Check {
            config,
            schemas,
            json,
        } => handle_check(&config, schemas.as_deref(), json),
        Commands::Deps { expression } => handle_deps(&expression),
        Commands::Eval {
            expression,
            form,
            field_value,
            external,
        } => handle_eval(&expression, &form, &field_value, &external),
        Commands::Simulate {
            config,
            schemas,
            edits,
            lenient,
        } => handle_simulate(&config, schemas.as_deref(), &edits, lenient).await,
    };

    if let Err(error) = result {
        eprintln!("{} {error:#}", "error:".red().bold());
        process::exit(1);
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("reading stdin")?;
        return Ok(buffer);
    }
    fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))
}

fn engine(schemas: Option<&Path>, config: EngineConfig) -> Result<FormEngine> {
    let mut registry = SchemaRegistry::new();
    if let Some(path) = schemas {
        let count = registry.register_json(&read_input(path)?)?;
        log::info!("Loaded {count} schema(s) from '{}'", path.display());
    }
    Ok(FormEngine::builder()
        .with_config(config)
        .with_schemas(registry)
        .build())
}

fn print_entry(entry: &RuleEntry) {
    let category = match entry.category {
        RuleCategory::Validator => "validator",
        RuleCategory::Logic => "logic",
        RuleCategory::Schema => "schema",
    };
    let locality = if entry.locality.is_cross_field() {
        entry.locality.to_string().yellow()
    } else {
        entry.locality.to_string().green()
    };
    println!(
        "  {:<24} {:<10} {:<12} {:<28} [{}]",
        entry.source_field.to_string().bold(),
        category,
        locality,
        entry.rule,
        entry.depends_on.to_vec().join(", ")
    );
}

fn handle_check(config: &Path, schemas: Option<&Path>, json: bool) -> Result<()> {
    let form = FormConfig::from_json(&read_input(config)?)?;
    let rules = engine(schemas, EngineConfig::lenient())?.collect(&form);

    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
    } else {
        println!("{}", "Rules".bold().underline());
        rules.entries().for_each(print_entry);
        if !rules.derivations.is_empty() {
            println!("{}", "Derivations".bold().underline());
            for &index in &rules.derivation_order {
                let derivation = &rules.derivations[index];
                println!(
                    "  {:<24} {:<10} {:<12} {:<28} [{}]",
                    derivation.target.to_string().bold(),
                    derivation.target_property.as_deref().unwrap_or("value"),
                    derivation.locality,
                    derivation.rule,
                    derivation.depends_on.to_vec().join(", ")
                );
            }
        }
        if !rules.diagnostics.is_empty() {
            let formatter = DiagnosticFormatter::new(Format::Text).with_color(true);
            println!("{}", "Diagnostics".bold().underline());
            println!("{}", formatter.format_all(&rules.diagnostics));
        }
    }

    if !rules.errors.is_empty() {
        for error in &rules.errors {
            eprintln!("{} {error}", "configuration error:".red());
        }
        bail!("{} rule(s) could not be installed", rules.errors.len());
    }
    Ok(())
}

fn handle_deps(expression: &str) -> Result<()> {
    let deps = extract_expression_dependencies(expression)?;
    for dep in deps {
        println!("{dep}");
    }
    Ok(())
}

fn parse_json(label: &str, input: &str) -> Result<Value> {
    serde_json::from_str(input).with_context(|| format!("parsing {label} JSON"))
}

fn handle_eval(expression: &str, form: &str, field_value: &str, external: &str) -> Result<()> {
    // syntax errors read better from the parser than from the evaluator
    parse(expression)?;
    let form = parse_json("form", form)?;
    let field_value = parse_json("field value", field_value)?;
    let external = parse_json("external data", external)?;

    let engine = FormEngine::new();
    let scope = EvaluationScope::new(&field_value, &form).with_external_data(&external);
    let result = engine.evaluator().evaluate_source(expression, &scope)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn parse_edit(edit: &str) -> Result<(&str, Value)> {
    let Some((path, json)) = edit.split_once('=') else {
        bail!("expected PATH=JSON, got '{edit}'");
    };
    // bare words are taken as strings
    let value = serde_json::from_str(json).unwrap_or_else(|_| Value::String(json.to_string()));
    Ok((path.trim(), value))
}

async fn handle_simulate(
    config: &Path,
    schemas: Option<&Path>,
    edits: &[String],
    lenient: bool,
) -> Result<()> {
    let settings = if lenient {
        EngineConfig::lenient()
    } else {
        EngineConfig::default()
    };
    let form = engine(schemas, settings)?.build_form_json(&read_input(config)?)?;
    form.settled().await;

    for edit in edits {
        let (path, value) = parse_edit(edit)?;
        form.set_value(path, value)?;
        form.settled().await;
    }

    println!("{}", serde_json::to_string_pretty(&form.fields())?);
    let status = if form.is_valid() {
        "valid".green()
    } else {
        "invalid".red()
    };
    eprintln!("form is {status}");
    Ok(())
}
