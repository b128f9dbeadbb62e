//! Trace event records.
//!
//! An [`Event`] is one immutable fact recorded during a run. Construction
//! guarantees the payload and meta are JSON objects that serialize cleanly;
//! redaction and truncation are the caller's job (see [`crate::redact`])
//! and happen before an event is built.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Schema version stamped on every event and run record.
pub const SPEC_VERSION: &str = "0.1";

/// Values nested deeper than this are stringified wholesale.
pub const MAX_JSON_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStart,
    RunEnd,
    LlmCall,
    ToolCall,
    StateUpdate,
    Error,
    LoopWarning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStart => "RUN_START",
            EventType::RunEnd => "RUN_END",
            EventType::LlmCall => "LLM_CALL",
            EventType::ToolCall => "TOOL_CALL",
            EventType::StateUpdate => "STATE_UPDATE",
            EventType::Error => "ERROR",
            EventType::LoopWarning => "LOOP_WARNING",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub spec_version: String,
    pub event_id: String,
    pub run_id: String,
    pub parent_id: Option<String>,
    pub event_type: EventType,
    pub ts: String,
    pub duration_ms: Option<u64>,
    pub name: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default = "empty_object")]
    pub meta: Value,
}

/// Build an event with a fresh id and the current timestamp.
///
/// A null payload becomes `{}`; any other non-object payload is wrapped as
/// `{"value": ...}`.
pub fn new_event(event_type: EventType, run_id: &str, name: &str, payload: Value) -> Event {
    Event {
        spec_version: SPEC_VERSION.to_string(),
        event_id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        parent_id: None,
        event_type,
        ts: utc_now_iso_ms_z(),
        duration_ms: None,
        name: name.to_string(),
        payload: object_or_wrapped(payload),
        meta: empty_object(),
    }
}

impl Event {
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach meta; normalized with the same rules as the payload.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = object_or_wrapped(meta);
        self
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn object_or_wrapped(value: Value) -> Value {
    match json_safe(value, 0) {
        Value::Null => empty_object(),
        obj @ Value::Object(_) => obj,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Apply the depth cutoff: anything below [`MAX_JSON_DEPTH`] is replaced by
/// its serialized text.
fn json_safe(value: Value, depth: usize) -> Value {
    if depth > MAX_JSON_DEPTH {
        return match value {
            Value::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        };
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, json_safe(v, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| json_safe(v, depth + 1))
                .collect(),
        ),
        scalar => scalar,
    }
}

/// Convert any serializable value into JSON. A value that refuses to
/// serialize (non-string map keys, a failing `Serialize` impl) is recorded
/// as the text of the serialization error instead.
pub fn to_json_value<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| Value::String(format!("<unserializable: {err}>")))
}

/// Current UTC time, millisecond precision, `Z` suffix
/// (e.g. `2026-02-15T20:31:05.123Z`).
pub fn utc_now_iso_ms_z() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp; `None` when missing or malformed.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Milliseconds from `started_at` to `now`, clamped at zero; zero when the
/// start cannot be parsed.
pub fn elapsed_ms(started_at: &str, now: DateTime<Utc>) -> u64 {
    match parse_ts(started_at) {
        Some(start) => (now - start).num_milliseconds().max(0) as u64,
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_event_has_schema_fields() {
        let ev = new_event(EventType::ToolCall, "run-1", "search", json!({"q": "rust"}));
        assert_eq!(ev.spec_version, SPEC_VERSION);
        assert_eq!(ev.event_type, EventType::ToolCall);
        assert_eq!(ev.run_id, "run-1");
        assert_eq!(ev.name, "search");
        assert!(ev.parent_id.is_none());
        assert!(ev.duration_ms.is_none());
        assert_eq!(ev.meta, json!({}));
        assert!(uuid::Uuid::parse_str(&ev.event_id).is_ok());
        assert!(ev.ts.ends_with('Z'));
        assert_eq!(ev.ts.len(), "2026-02-15T20:31:05.123Z".len());
    }

    #[test]
    fn event_ids_are_unique() {
        let a = new_event(EventType::StateUpdate, "r", "state", Value::Null);
        let b = new_event(EventType::StateUpdate, "r", "state", Value::Null);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn null_payload_defaults_to_empty_object() {
        let ev = new_event(EventType::RunEnd, "r", "run_end", Value::Null);
        assert_eq!(ev.payload, json!({}));
    }

    #[test]
    fn non_object_payload_and_meta_are_wrapped() {
        let ev = new_event(EventType::StateUpdate, "r", "state", json!([1, 2]))
            .with_meta(json!("note"));
        assert_eq!(ev.payload, json!({"value": [1, 2]}));
        assert_eq!(ev.meta, json!({"value": "note"}));
    }

    #[test]
    fn deep_values_are_stringified_past_cutoff() {
        let mut deep = json!("leaf");
        for _ in 0..15 {
            deep = json!({ "n": deep });
        }
        let ev = new_event(EventType::StateUpdate, "r", "state", deep);

        let mut cursor = &ev.payload;
        let mut levels = 0;
        while let Some(next) = cursor.get("n") {
            cursor = next;
            levels += 1;
        }
        assert!(cursor.is_string(), "cutoff should leave a string, got {cursor}");
        assert!(levels <= MAX_JSON_DEPTH + 1);
    }

    #[test]
    fn serialized_event_type_uses_wire_names() {
        let ev = new_event(EventType::LoopWarning, "r", "A -> B", json!({}));
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.contains(r#""event_type":"LOOP_WARNING""#), "got: {line}");
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn builder_sets_parent_and_duration() {
        let ev = new_event(EventType::ToolCall, "r", "t", json!({}))
            .with_parent("p-1")
            .with_duration_ms(42);
        assert_eq!(ev.parent_id.as_deref(), Some("p-1"));
        assert_eq!(ev.duration_ms, Some(42));
    }

    #[test]
    fn elapsed_ms_clamps_and_tolerates_garbage() {
        let now = parse_ts("2026-02-15T20:31:05.123Z").unwrap();
        assert_eq!(elapsed_ms("2026-02-15T20:31:04.023Z", now), 1100);
        assert_eq!(elapsed_ms("2026-02-15T20:31:06.000Z", now), 0);
        assert_eq!(elapsed_ms("yesterday", now), 0);
    }

    #[test]
    fn unserializable_values_become_strings() {
        let mut weird = std::collections::HashMap::new();
        weird.insert((1, 2), "tuple keys are not JSON keys");
        assert!(to_json_value(&weird).is_string());
        assert_eq!(to_json_value(&vec![1, 2]), json!([1, 2]));
    }
}
