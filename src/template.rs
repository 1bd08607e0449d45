// src/template.rs
// Loads raw configuration sections from template files.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use xdg::BaseDirectories;

use crate::errors::BuilderError;

pub const APP_NAME: &str = "ionos-image-builder";
pub const DEFAULT_TEMPLATE_FILENAME: &str = "builder.toml";

/// One source of configuration keys, before interpolation and decoding.
pub type RawSection = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Toml,
    Json,
    Yaml,
}

impl TemplateFormat {
    pub fn from_path(path: &Path) -> Result<Self, BuilderError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("toml") => Ok(TemplateFormat::Toml),
            Some("json") => Ok(TemplateFormat::Json),
            Some("yaml") | Some("yml") => Ok(TemplateFormat::Yaml),
            _ => Err(BuilderError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

fn parse_value(contents: &str, format: TemplateFormat, path: &Path) -> Result<Value, BuilderError> {
    match format {
        TemplateFormat::Toml => toml::from_str(contents).map_err(|source| BuilderError::Toml {
            path: path.to_path_buf(),
            source,
        }),
        TemplateFormat::Json => serde_json::from_str(contents).map_err(|source| BuilderError::Json {
            path: path.to_path_buf(),
            source,
        }),
        TemplateFormat::Yaml => serde_yaml::from_str(contents).map_err(|source| BuilderError::Yaml {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parses `contents` as a raw section. `path` is only used in error messages.
pub fn parse_raw(contents: &str, format: TemplateFormat, path: &Path) -> Result<RawSection, BuilderError> {
    match parse_value(contents, format, path)? {
        Value::Object(map) => Ok(map),
        // An empty YAML document parses to null.
        Value::Null => Ok(RawSection::new()),
        _ => Err(BuilderError::NotAnObject(path.to_path_buf())),
    }
}

fn read(path: &Path) -> Result<String, BuilderError> {
    std::fs::read_to_string(path).map_err(|source| BuilderError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_raw(path: &Path) -> Result<RawSection, BuilderError> {
    let format = TemplateFormat::from_path(path)?;
    info!("Loading template from {}", path.display());
    let raw = parse_raw(&read(path)?, format, path)?;
    debug!(keys = raw.len(), "Parsed template {}", path.display());
    Ok(raw)
}

/// Later sections override earlier ones key by key.
pub fn merge_raws(raws: &[RawSection]) -> RawSection {
    let mut merged = RawSection::new();
    for raw in raws {
        for (key, value) in raw {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// `builder.toml` in the XDG config directory, if it exists.
pub fn default_template_path() -> Result<Option<PathBuf>, BuilderError> {
    let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
    Ok(xdg_dirs.find_config_file(DEFAULT_TEMPLATE_FILENAME))
}

/// Parses a `KEY=VALUE` user variable. The value may be empty or contain `=`.
pub fn parse_var(s: &str) -> Result<(String, String), BuilderError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(BuilderError::InvalidVariable(s.to_string())),
    }
}

/// Loads user variables from a TOML, JSON or YAML file of scalar values.
pub fn load_var_file(path: &Path) -> Result<HashMap<String, String>, BuilderError> {
    let raw = load_raw(path)?;
    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(BuilderError::NonScalarVariable {
                        path: path.to_path_buf(),
                        key,
                    })
                }
            };
            Ok((key, text))
        })
        .collect()
}
