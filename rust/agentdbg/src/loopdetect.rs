//! Loop detection over the tail of a run's event stream.
//!
//! Each event is reduced to a short signature (the model for LLM calls, the
//! tool for tool calls, the bare type otherwise). A loop is the smallest
//! block of signatures that repeats back-to-back at the very end of the
//! window. Pure functions, no I/O.

use crate::events::{Event, EventType};
use crate::redact::is_truthy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stands in for an evidence id when an event has none.
pub const MISSING_EVENT_ID: &str = "__MISSING__";

pub const PATTERN_SEPARATOR: &str = " -> ";

/// Payload of a LOOP_WARNING event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopWarning {
    pub pattern: String,
    pub repetitions: usize,
    pub window_size: usize,
    pub evidence_event_ids: Vec<String>,
}

impl LoopWarning {
    /// Dedup key; see [`pattern_key`].
    pub fn key(&self) -> String {
        pattern_key(self)
    }
}

/// Signature used to compare events for repetition.
pub fn compute_signature(event: &Event) -> String {
    match event.event_type {
        EventType::LlmCall => format!("LLM_CALL:{}", payload_label(&event.payload, "model")),
        EventType::ToolCall => format!("TOOL_CALL:{}", payload_label(&event.payload, "tool_name")),
        other => other.as_str().to_string(),
    }
}

fn payload_label(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(v) if is_truthy(v) => v.to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

/// Find the smallest block repeated `repetitions` times at the end of the
/// last `window` events.
///
/// Returns `None` for empty input, `repetitions < 2`, `window < 2`, or when
/// the tail does not repeat.
pub fn detect_loop(events: &[Event], window: usize, repetitions: usize) -> Option<LoopWarning> {
    if events.is_empty() || repetitions < 2 || window < 2 {
        return None;
    }

    let start = events.len().saturating_sub(window);
    let considered = &events[start..];
    let n = considered.len();
    let sigs: Vec<String> = considered.iter().map(compute_signature).collect();

    for m in 1..=(n / repetitions) {
        let span = m * repetitions;
        let tail = &sigs[n - span..];
        let block = &tail[..m];
        if tail.chunks(m).all(|chunk| chunk == block) {
            let evidence_event_ids = considered[n - span..]
                .iter()
                .map(|e| {
                    if e.event_id.is_empty() {
                        MISSING_EVENT_ID.to_string()
                    } else {
                        e.event_id.clone()
                    }
                })
                .collect();
            return Some(LoopWarning {
                pattern: block.join(PATTERN_SEPARATOR),
                repetitions,
                window_size: n,
                evidence_event_ids,
            });
        }
    }
    None
}

/// Stable key for "already warned" bookkeeping. Built from the pattern and
/// repetition count only, so fresh evidence for the same loop maps to the
/// same key.
pub fn pattern_key(warning: &LoopWarning) -> String {
    format!("{}|{}", warning.pattern, warning.repetitions)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
