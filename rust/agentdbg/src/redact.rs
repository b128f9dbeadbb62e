//! Redaction and truncation applied to every payload before it is persisted.
//!
//! [`sanitize`] never fails and never mutates its input: sensitive values are
//! replaced by [`REDACTED_MARKER`], oversized strings are cut to the byte
//! budget with [`TRUNCATED_MARKER`] appended, and anything nested deeper than
//! [`DEPTH_LIMIT`] collapses to the truncation marker.

use crate::config::Config;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

pub const REDACTED_MARKER: &str = "__REDACTED__";
pub const TRUNCATED_MARKER: &str = "__TRUNCATED__";
pub const DEPTH_LIMIT: usize = 10;

/// `--option=value` / `-o=value`.
static ARGV_OPTION_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(-{1,2})([a-zA-Z0-9_-]+)=(.*)$").expect("argv pattern is valid"));

/// True if `key` contains any configured sensitive substring, ignoring case.
pub fn key_matches_redact(key: &str, redact_keys: &[String]) -> bool {
    let key = key.to_lowercase();
    redact_keys
        .iter()
        .any(|rk| key.contains(rk.to_lowercase().as_str()))
}

/// Redact and truncate a JSON value according to `config`.
pub fn sanitize(value: &Value, config: &Config) -> Value {
    sanitize_at(value, config, 0)
}

fn sanitize_at(value: &Value, config: &Config, depth: usize) -> Value {
    if depth > DEPTH_LIMIT {
        return Value::String(TRUNCATED_MARKER.to_string());
    }
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(s) => Value::String(truncate_string(s, config.max_field_bytes)),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let sanitized = if config.redact && key_matches_redact(key, &config.redact_keys) {
                    Value::String(REDACTED_MARKER.to_string())
                } else {
                    sanitize_at(v, config, depth + 1)
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_at(item, config, depth + 1))
                .collect(),
        ),
    }
}

/// Cut `s` so that the result, marker included, fits in `max_bytes` UTF-8
/// bytes. Never splits a code point. A zero budget disables truncation; a
/// budget smaller than the marker yields a cut-down marker.
pub fn truncate_string(s: &str, max_bytes: usize) -> String {
    if max_bytes == 0 || s.len() <= max_bytes {
        return s.to_string();
    }
    if max_bytes < TRUNCATED_MARKER.len() {
        return TRUNCATED_MARKER[..max_bytes].to_string();
    }
    let mut limit = max_bytes.saturating_sub(TRUNCATED_MARKER.len()).min(s.len());
    while !s.is_char_boundary(limit) {
        limit -= 1;
    }
    let mut out = String::with_capacity(limit + TRUNCATED_MARKER.len());
    out.push_str(&s[..limit]);
    out.push_str(TRUNCATED_MARKER);
    out
}

/// Redact only the value part of sensitive `--name=value` tokens. Option
/// names are compared with hyphens normalized to underscores, so
/// `--api-key=sk-1` matches the `api_key` rule. Order and count are kept.
pub fn redact_argv(argv: &[String], config: &Config) -> Vec<String> {
    if !config.redact {
        return argv.to_vec();
    }
    argv.iter()
        .map(|item| match ARGV_OPTION_VALUE.captures(item) {
            Some(caps) => {
                let prefix = &caps[1];
                let name = &caps[2];
                if key_matches_redact(&name.replace('-', "_"), &config.redact_keys) {
                    format!("{prefix}{name}={REDACTED_MARKER}")
                } else {
                    item.clone()
                }
            }
            None => item.clone(),
        })
        .collect()
}

/// Reduce a provider usage object to
/// `{prompt_tokens, completion_tokens, total_tokens}`.
///
/// Returns `None` for a missing or non-object input. Floats are truncated
/// to integers; anything non-numeric becomes null for that key.
pub fn normalize_usage(usage: Option<&Value>) -> Option<Value> {
    let map = usage?.as_object()?;
    let token = |key: &str| -> Value {
        match map.get(key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Value::from(i)
                } else if let Some(u) = n.as_u64() {
                    Value::from(u)
                } else {
                    match n.as_f64() {
                        Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Value::from(f as i64),
                        _ => Value::Null,
                    }
                }
            }
            _ => Value::Null,
        }
    };
    Some(json!({
        "prompt_tokens": token("prompt_tokens"),
        "completion_tokens": token("completion_tokens"),
        "total_tokens": token("total_tokens"),
    }))
}

// ---------------------------------------------------------------------------
// Error payloads
// ---------------------------------------------------------------------------

/// Where an error object for a call payload comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSource {
    /// A caught error value.
    Error {
        error_type: String,
        message: String,
        stack: Option<String>,
    },
    /// A bare message; reported with the generic `Error` type.
    Message(String),
    /// A pre-built object. The type may be under `error_type` or, for older
    /// producers, under `type`.
    Structured(Map<String, Value>),
}

impl ErrorSource {
    /// Capture a concrete error: its short type name, display text, and the
    /// chain of `source()` causes as the stack text.
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        ErrorSource::Error {
            error_type: short_type_name(std::any::type_name::<E>()),
            message: err.to_string(),
            stack: Some(render_source_chain(err)),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        ErrorSource::Message(message.into())
    }

    /// Accepts any JSON value; non-objects are treated as a message.
    pub fn structured(value: Value) -> Self {
        match value {
            Value::Object(map) => ErrorSource::Structured(map),
            Value::String(s) => ErrorSource::Message(s),
            other => ErrorSource::Message(other.to_string()),
        }
    }
}

impl From<&str> for ErrorSource {
    fn from(message: &str) -> Self {
        ErrorSource::Message(message.to_string())
    }
}

impl From<String> for ErrorSource {
    fn from(message: String) -> Self {
        ErrorSource::Message(message)
    }
}

/// Build the `{error_type, message, details, stack}` object embedded in
/// call payloads. The result is sanitized before it is returned.
pub fn build_error_payload(
    source: Option<&ErrorSource>,
    config: &Config,
    include_stack: bool,
) -> Option<Value> {
    let err = match source? {
        ErrorSource::Error {
            error_type,
            message,
            stack,
        } => {
            let stack = if include_stack { stack.clone() } else { None };
            json!({
                "error_type": error_type,
                "message": message,
                "details": null,
                "stack": stack,
            })
        }
        ErrorSource::Message(message) => json!({
            "error_type": "Error",
            "message": message,
            "details": null,
            "stack": null,
        }),
        ErrorSource::Structured(map) => {
            let error_type = match map.get("error_type") {
                Some(v) if is_truthy(v) => v.clone(),
                _ => map.get("type").cloned().unwrap_or_else(|| json!("Error")),
            };
            let message = map.get("message").cloned().unwrap_or_else(|| json!(""));
            let details = map.get("details").cloned().unwrap_or(Value::Null);
            let stack = match map.get("stack") {
                Some(stack) if include_stack => stack.clone(),
                _ => Value::Null,
            };
            json!({
                "error_type": error_type,
                "message": message,
                "details": details,
                "stack": stack,
            })
        }
    };
    Some(sanitize(&err, config))
}

/// Falsy values: null, false, zero, empty string/array/object.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// `core::fmt::Error` -> `Error`, `alloc::boxed::Box<dyn core::error::Error>`
/// -> `Box<dyn Error>`.
pub(crate) fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for ch in full.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            segment.push(ch);
        } else {
            out.push_str(segment.rsplit("::").next().unwrap_or(""));
            segment.clear();
            out.push(ch);
        }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or(""));
    out
}

fn render_source_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        text.push_str("\nCaused by: ");
        text.push_str(&inner.to_string());
        cause = inner.source();
    }
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
