//! Manual recorders: LLM calls, tool calls and state updates.
//!
//! Each recorder writes into the run returned by the ambient lookup and is a
//! silent no-op when there is none. Inputs are collected with small builders
//! so optional fields stay optional at the call site:
//!
//! ```no_run
//! use agentdbg::{record_llm_call, LlmCall};
//!
//! record_llm_call(
//!     LlmCall::new("gpt-4o")
//!         .prompt("What is 2 + 2?")
//!         .response("4")
//!         .usage(serde_json::json!({"prompt_tokens": 9, "completion_tokens": 1})),
//! )?;
//! # Ok::<(), agentdbg::Error>(())
//! ```

use crate::config::Config;
use crate::error::Result;
use crate::events::{to_json_value, EventType};
use crate::redact::{build_error_payload, normalize_usage, ErrorSource};
use crate::trace::context::ensure_run;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";
pub const DEFAULT_PROVIDER: &str = "unknown";
const STATE_EVENT_NAME: &str = "state";

/// Anything other than `"error"` records as `"ok"`.
fn coerce_status(status: &str) -> &'static str {
    if status == STATUS_ERROR {
        STATUS_ERROR
    } else {
        STATUS_OK
    }
}

fn empty_meta() -> Value {
    Value::Object(Map::new())
}

// ---------------------------------------------------------------------------
// LLM calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmCall {
    model: String,
    prompt: Value,
    response: Value,
    usage: Option<Value>,
    meta: Value,
    provider: String,
    temperature: Value,
    stop_reason: Option<String>,
    status: &'static str,
    error: Option<ErrorSource>,
}

impl LlmCall {
    pub fn new(model: impl Into<String>) -> Self {
        LlmCall {
            model: model.into(),
            prompt: Value::Null,
            response: Value::Null,
            usage: None,
            meta: empty_meta(),
            provider: DEFAULT_PROVIDER.to_string(),
            temperature: Value::Null,
            stop_reason: None,
            status: STATUS_OK,
            error: None,
        }
    }

    pub fn prompt(mut self, prompt: impl Serialize) -> Self {
        self.prompt = to_json_value(&prompt);
        self
    }

    pub fn response(mut self, response: impl Serialize) -> Self {
        self.response = to_json_value(&response);
        self
    }

    /// Token usage. Only `prompt_tokens`, `completion_tokens` and
    /// `total_tokens` are kept.
    pub fn usage(mut self, usage: impl Serialize) -> Self {
        self.usage = Some(to_json_value(&usage));
        self
    }

    pub fn meta(mut self, meta: impl Serialize) -> Self {
        self.meta = to_json_value(&meta);
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Usually a float, but any serializable value is kept as given.
    pub fn temperature(mut self, temperature: impl Serialize) -> Self {
        self.temperature = to_json_value(&temperature);
        self
    }

    pub fn stop_reason(mut self, stop_reason: impl Into<String>) -> Self {
        self.stop_reason = Some(stop_reason.into());
        self
    }

    pub fn status(mut self, status: impl AsRef<str>) -> Self {
        self.status = coerce_status(status.as_ref());
        self
    }

    /// Error detail. Recorded only when the status is `"error"`.
    pub fn error(mut self, error: impl Into<ErrorSource>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Shorthand for `.status("error").error(err)`.
    pub fn failed(self, error: impl Into<ErrorSource>) -> Self {
        self.status(STATUS_ERROR).error(error)
    }

    fn payload(&self, config: &Config) -> Value {
        let error = error_object(self.status, self.error.as_ref(), config);
        json!({
            "model": self.model,
            "prompt": self.prompt,
            "response": self.response,
            "usage": normalize_usage(self.usage.as_ref()),
            "provider": self.provider,
            "temperature": self.temperature,
            "stop_reason": self.stop_reason,
            "status": self.status,
            "error": error,
        })
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ToolCall {
    name: String,
    args: Value,
    result: Value,
    meta: Value,
    status: &'static str,
    error: Option<ErrorSource>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        ToolCall {
            name: name.into(),
            args: Value::Null,
            result: Value::Null,
            meta: empty_meta(),
            status: STATUS_OK,
            error: None,
        }
    }

    pub fn args(mut self, args: impl Serialize) -> Self {
        self.args = to_json_value(&args);
        self
    }

    pub fn result(mut self, result: impl Serialize) -> Self {
        self.result = to_json_value(&result);
        self
    }

    pub fn meta(mut self, meta: impl Serialize) -> Self {
        self.meta = to_json_value(&meta);
        self
    }

    pub fn status(mut self, status: impl AsRef<str>) -> Self {
        self.status = coerce_status(status.as_ref());
        self
    }

    /// Error detail. Recorded only when the status is `"error"`.
    pub fn error(mut self, error: impl Into<ErrorSource>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn failed(self, error: impl Into<ErrorSource>) -> Self {
        self.status(STATUS_ERROR).error(error)
    }

    fn payload(&self, config: &Config) -> Value {
        let error = error_object(self.status, self.error.as_ref(), config);
        json!({
            "tool_name": self.name,
            "args": self.args,
            "result": self.result,
            "status": self.status,
            "error": error,
        })
    }
}

fn error_object(status: &str, error: Option<&ErrorSource>, config: &Config) -> Option<Value> {
    if status != STATUS_ERROR {
        return None;
    }
    build_error_payload(error, config, true)
}

// ---------------------------------------------------------------------------
// State updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StateUpdate {
    state: Value,
    diff: Value,
    meta: Value,
}

impl StateUpdate {
    pub fn new(state: impl Serialize) -> Self {
        StateUpdate {
            state: to_json_value(&state),
            diff: Value::Null,
            meta: empty_meta(),
        }
    }

    pub fn diff(mut self, diff: impl Serialize) -> Self {
        self.diff = to_json_value(&diff);
        self
    }

    pub fn meta(mut self, meta: impl Serialize) -> Self {
        self.meta = to_json_value(&meta);
        self
    }

    fn payload(&self) -> Value {
        json!({ "state": self.state, "diff": self.diff })
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

/// Record an LLM call in the current run. Counts toward `llm_calls`.
pub fn record_llm_call(call: LlmCall) -> Result<()> {
    let Some(run) = ensure_run()? else {
        return Ok(());
    };
    let mut run = run.lock();
    let payload = call.payload(&run.config);
    run.record(EventType::LlmCall, &call.model, payload, call.meta)
}

/// Record a tool call in the current run. Counts toward `tool_calls`.
pub fn record_tool_call(call: ToolCall) -> Result<()> {
    let Some(run) = ensure_run()? else {
        return Ok(());
    };
    let mut run = run.lock();
    let payload = call.payload(&run.config);
    run.record(EventType::ToolCall, &call.name, payload, call.meta)
}

/// Record a state snapshot. No counter moves, but the event takes part in
/// loop detection like any other.
pub fn record_state(update: StateUpdate) -> Result<()> {
    let Some(run) = ensure_run()? else {
        return Ok(());
    };
    let mut run = run.lock();
    run.record(EventType::StateUpdate, STATE_EVENT_NAME, update.payload(), update.meta)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
