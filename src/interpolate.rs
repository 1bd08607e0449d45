// src/interpolate.rs
// Renders `{{ ... }}` expressions in template strings.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ValidationError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolateError {
    #[error("unterminated '{{{{' starting at byte {0}")]
    Unterminated(usize),
    #[error("empty expression '{{{{}}}}'")]
    EmptyExpression,
    #[error("function \"{0}\" not defined")]
    UnknownFunction(String),
    #[error("function \"{0}\" requires a quoted argument")]
    MissingArgument(String),
    #[error("function \"{0}\" takes no arguments")]
    UnexpectedArgument(String),
    #[error("malformed argument {0}: expected a `backtick` or \"double\" quoted string")]
    MalformedArgument(String),
    #[error("user variable '{0}' is not defined")]
    UndefinedVariable(String),
    #[error("invalid time format '{0}'")]
    InvalidTimeFormat(String),
}

/// Values available to template functions during one render pass.
#[derive(Debug, Clone)]
pub struct Context {
    pub user_variables: HashMap<String, String>,
    pub build_name: Option<String>,
    pub build_type: Option<String>,
    /// Captured once so every `{{timestamp}}` in a run agrees.
    pub now: DateTime<Utc>,
}

impl Context {
    pub fn new(now: DateTime<Utc>) -> Self {
        Context {
            user_variables: HashMap::new(),
            build_name: None,
            build_type: None,
            now,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(Utc::now())
    }
}

/// Keys whose values are passed through unrendered. A trailing `*` matches by prefix.
#[derive(Debug, Clone, Default)]
pub struct RenderFilter {
    pub exclude: Vec<String>,
}

impl RenderFilter {
    pub fn excludes(&self, key: &str) -> bool {
        self.exclude.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        })
    }
}

pub fn render(template: &str, ctx: &Context) -> Result<String, InterpolateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(InterpolateError::Unterminated(offset + start))?;
        out.push_str(&evaluate(after_open[..end].trim(), ctx)?);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn evaluate(expr: &str, ctx: &Context) -> Result<String, InterpolateError> {
    if expr.is_empty() {
        return Err(InterpolateError::EmptyExpression);
    }
    let (name, raw_arg) = match expr.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim())),
        None => (expr, None),
    };
    let arg = raw_arg.map(unquote).transpose()?;

    match (name, arg) {
        ("timestamp", None) => Ok(ctx.now.timestamp().to_string()),
        ("uuid", None) => Ok(Uuid::new_v4().to_string()),
        ("build_name", None) => Ok(ctx.build_name.clone().unwrap_or_default()),
        ("build_type", None) => Ok(ctx.build_type.clone().unwrap_or_default()),
        ("isotime", None) => Ok(ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("isotime", Some(format)) => format_time(ctx.now, format),
        ("user", Some(key)) => ctx
            .user_variables
            .get(key)
            .cloned()
            .ok_or_else(|| InterpolateError::UndefinedVariable(key.to_string())),
        ("upper", Some(value)) => Ok(value.to_uppercase()),
        ("lower", Some(value)) => Ok(value.to_lowercase()),
        ("timestamp" | "uuid" | "build_name" | "build_type", Some(_)) => {
            Err(InterpolateError::UnexpectedArgument(name.to_string()))
        }
        ("user" | "upper" | "lower", None) => {
            Err(InterpolateError::MissingArgument(name.to_string()))
        }
        _ => Err(InterpolateError::UnknownFunction(name.to_string())),
    }
}

fn unquote(arg: &str) -> Result<&str, InterpolateError> {
    for quote in ['`', '"'] {
        if arg.len() >= 2 && arg.starts_with(quote) && arg.ends_with(quote) {
            return Ok(&arg[1..arg.len() - 1]);
        }
    }
    Err(InterpolateError::MalformedArgument(arg.to_string()))
}

fn format_time(now: DateTime<Utc>, format: &str) -> Result<String, InterpolateError> {
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(InterpolateError::InvalidTimeFormat(format.to_string()));
    }
    Ok(now.format_with_items(items.into_iter()).to_string())
}

/// Renders every string inside `value`, recursing into arrays and objects.
pub fn render_value(value: &mut Value, ctx: &Context) -> Result<(), InterpolateError> {
    match value {
        Value::String(s) => {
            if s.contains("{{") {
                *s = render(s, ctx)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(|item| render_value(item, ctx)),
        Value::Object(map) => map.values_mut().try_for_each(|item| render_value(item, ctx)),
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

/// Renders each top-level entry not excluded by `filter`. One error per failing key.
pub fn render_raw(
    raw: &mut Map<String, Value>,
    ctx: &Context,
    filter: &RenderFilter,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for (key, value) in raw.iter_mut() {
        if filter.excludes(key) {
            continue;
        }
        if let Err(e) = render_value(value, ctx) {
            errors.push(ValidationError::Interpolation {
                key: key.clone(),
                message: e.to_string(),
            });
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> Context {
        let mut ctx = Context::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());
        ctx.user_variables
            .insert("image".to_string(), "ubuntu:latest".to_string());
        ctx.build_name = Some("web".to_string());
        ctx.build_type = Some("ionoscloud".to_string());
        ctx
    }

    #[test]
    fn plain_text_is_unchanged() {
        assert_eq!(render("no templates here", &ctx()).unwrap(), "no templates here");
    }

    #[test]
    fn timestamp_uses_captured_time() {
        assert_eq!(render("packer-{{timestamp}}", &ctx()).unwrap(), "packer-1709296200");
        assert_eq!(render("{{ timestamp }}", &ctx()).unwrap(), "1709296200");
    }

    #[test]
    fn user_variables_with_either_quote() {
        assert_eq!(render("{{user `image`}}", &ctx()).unwrap(), "ubuntu:latest");
        assert_eq!(render("{{user \"image\"}}", &ctx()).unwrap(), "ubuntu:latest");
    }

    #[test]
    fn undefined_user_variable_is_an_error() {
        assert_eq!(
            render("{{user `missing`}}", &ctx()),
            Err(InterpolateError::UndefinedVariable("missing".to_string()))
        );
    }

    #[test]
    fn isotime_default_and_custom_format() {
        assert_eq!(render("{{isotime}}", &ctx()).unwrap(), "2024-03-01T12:30:00Z");
        assert_eq!(render("{{isotime `%Y%m%d`}}", &ctx()).unwrap(), "20240301");
        assert!(matches!(
            render("{{isotime `%Q`}}", &ctx()),
            Err(InterpolateError::InvalidTimeFormat(_))
        ));
    }

    #[test]
    fn build_metadata_and_case_functions() {
        assert_eq!(
            render("{{build_name}}-{{build_type}}-{{upper `x`}}{{lower `Y`}}", &ctx()).unwrap(),
            "web-ionoscloud-Xy"
        );
    }

    #[test]
    fn uuid_renders_a_v4_uuid() {
        let rendered = render("{{uuid}}", &ctx()).unwrap();
        assert_eq!(Uuid::parse_str(&rendered).unwrap().get_version_num(), 4);
    }

    #[test]
    fn malformed_expressions() {
        assert_eq!(render("abc {{timestamp", &ctx()), Err(InterpolateError::Unterminated(4)));
        assert_eq!(render("{{}}", &ctx()), Err(InterpolateError::EmptyExpression));
        assert_eq!(
            render("{{nope}}", &ctx()),
            Err(InterpolateError::UnknownFunction("nope".to_string()))
        );
        assert_eq!(
            render("{{user}}", &ctx()),
            Err(InterpolateError::MissingArgument("user".to_string()))
        );
        assert_eq!(
            render("{{timestamp `x`}}", &ctx()),
            Err(InterpolateError::UnexpectedArgument("timestamp".to_string()))
        );
        assert!(matches!(
            render("{{user image}}", &ctx()),
            Err(InterpolateError::MalformedArgument(_))
        ));
    }

    #[test]
    fn render_raw_honors_filter_and_collects_errors() {
        let mut raw = json!({
            "image": "{{user `image`}}",
            "tags": ["{{build_name}}", 3],
            "run_command": "{{not_rendered}}",
            "packer_user_variables": {"x": "{{also_not}}"},
            "snapshot_name": "{{bad}}"
        })
        .as_object()
        .cloned()
        .unwrap();
        let filter = RenderFilter {
            exclude: vec!["run_command".to_string(), "packer_*".to_string()],
        };

        let errors = render_raw(&mut raw, &ctx(), &filter);

        assert_eq!(raw["image"], json!("ubuntu:latest"));
        assert_eq!(raw["tags"], json!(["web", 3]));
        assert_eq!(raw["run_command"], json!("{{not_rendered}}"));
        assert_eq!(raw["packer_user_variables"], json!({"x": "{{also_not}}"}));
        assert_eq!(
            errors,
            vec![ValidationError::Interpolation {
                key: "snapshot_name".to_string(),
                message: "function \"bad\" not defined".to_string(),
            }]
        );
    }
}
