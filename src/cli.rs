// src/cli.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{error, info};

use crate::config::{Config, PreparedConfig, BUILDER_TYPE};
use crate::errors::BuilderError;
use crate::secrets::SecretFilter;
use crate::template::{self, RawSection, DEFAULT_TEMPLATE_FILENAME};

/// Prepares and checks IONOS Cloud image builder templates
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Set log level (overrides RUST_LOG)
    #[clap(long, value_name = "LEVEL", value_enum, global = true)]
    pub log_level: Option<LogLevelCli>,

    /// Log line format
    #[clap(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a template and report every problem found
    Validate(TemplateArgs),
    /// Print the fully resolved configuration, secrets redacted
    Inspect {
        #[clap(flatten)]
        template: TemplateArgs,
        #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Args, Debug, Default)]
pub struct TemplateArgs {
    /// Template file (.toml, .json, .yaml); later files override earlier ones
    #[clap(short = 't', long = "template", value_name = "FILE")]
    pub templates: Vec<PathBuf>,

    /// User variable, usable as {{user `KEY`}}
    #[clap(long = "var", value_name = "KEY=VALUE", value_parser = parse_var_arg)]
    pub vars: Vec<(String, String)>,

    /// File of user variables; --var values take precedence
    #[clap(long, value_name = "FILE")]
    pub var_file: Option<PathBuf>,

    /// Build name, available as {{build_name}}
    #[clap(long, value_name = "NAME")]
    pub build_name: Option<String>,

    /// Mark the build as a debug build
    #[clap(long)]
    pub debug: bool,

    /// Force the build even if artifacts exist
    #[clap(long)]
    pub force: bool,
}

fn parse_var_arg(s: &str) -> Result<(String, String), BuilderError> {
    template::parse_var(s)
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevelCli {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevelCli {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevelCli::Trace => "trace",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Info => "info",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Error => "error",
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Toml,
    Yaml,
}

impl TemplateArgs {
    /// Raw sections in merge order: driver defaults, templates, then command line overrides.
    pub fn sections(&self) -> Result<Vec<RawSection>, BuilderError> {
        let mut sections = vec![section(json!({
            "packer_builder_type": BUILDER_TYPE,
            "packer_build_name": BUILDER_TYPE
        }))];

        let templates = if self.templates.is_empty() {
            let default = template::default_template_path()?
                .ok_or(BuilderError::NoTemplate(DEFAULT_TEMPLATE_FILENAME))?;
            vec![default]
        } else {
            self.templates.clone()
        };
        for path in &templates {
            sections.push(template::load_raw(path)?);
        }

        sections.push(self.overrides()?);
        Ok(sections)
    }

    fn overrides(&self) -> Result<RawSection, BuilderError> {
        let mut overrides = RawSection::new();

        let mut variables: HashMap<String, String> = match &self.var_file {
            Some(path) => template::load_var_file(path)?,
            None => HashMap::new(),
        };
        variables.extend(self.vars.iter().cloned());
        if !variables.is_empty() {
            overrides.insert("packer_user_variables".to_string(), json!(variables));
        }

        if let Some(name) = &self.build_name {
            overrides.insert("packer_build_name".to_string(), json!(name));
        }
        if self.debug {
            overrides.insert("packer_debug".to_string(), Value::Bool(true));
        }
        if self.force {
            overrides.insert("packer_force".to_string(), Value::Bool(true));
        }
        Ok(overrides)
    }

    pub fn prepare(&self) -> Result<PreparedConfig> {
        let sections = self.sections().context("Failed to load template")?;
        match Config::prepare(&sections) {
            Ok(prepared) => Ok(prepared),
            Err(errs) => {
                error!(count = errs.len(), "Template validation failed");
                Err(anyhow::Error::new(BuilderError::Invalid(errs)).context("Template validation failed"))
            }
        }
    }
}

fn section(value: Value) -> RawSection {
    match value {
        Value::Object(map) => map,
        _ => RawSection::new(),
    }
}

/// Drops null members; TOML has no way to write them.
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

pub fn render_output(prepared: &PreparedConfig, format: OutputFormat, secrets: &SecretFilter) -> Result<String> {
    // Redact before serializing, so escaping cannot hide a secret.
    let mut value = serde_json::to_value(prepared).context("Failed to serialize configuration")?;
    secrets.redact_value(&mut value);

    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&value).context("Failed to serialize configuration as JSON")?,
        OutputFormat::Toml => {
            strip_nulls(&mut value);
            toml::to_string_pretty(&value).context("Failed to serialize configuration as TOML")?
        }
        OutputFormat::Yaml => serde_yaml::to_string(&value).context("Failed to serialize configuration as YAML")?,
    };
    Ok(rendered)
}

pub fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Validate(args) => {
            args.prepare()?;
            info!("Template is valid");
            println!("The configuration is valid.");
        }
        Commands::Inspect { template, format } => {
            let prepared = template.prepare()?;
            println!("{}", render_output(&prepared, format, SecretFilter::global())?);
        }
    }
    Ok(())
}
