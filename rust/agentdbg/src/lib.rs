//! Local-first tracing and loop detection for agent programs.
//!
//! A traced run records LLM calls, tool calls, state snapshots and errors
//! as JSON lines under `<data_dir>/runs/<run_id>/`, redacting and truncating
//! every payload on the way in and warning when the tail of the run starts
//! repeating itself.
//!
//! ```no_run
//! use agentdbg::{record_llm_call, record_tool_call, traced_run, LlmCall, ToolCall};
//!
//! fn main() -> Result<(), agentdbg::Error> {
//!     traced_run(Some("weather agent"), || {
//!         record_tool_call(ToolCall::new("get_weather").args(serde_json::json!({"city": "Oslo"})))?;
//!         record_llm_call(LlmCall::new("gpt-4o").prompt("Summarize").response("Cold."))?;
//!         Ok(())
//!     })
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod loopdetect;
pub mod redact;
pub mod storage;
pub mod trace;

pub use config::Config;
pub use error::{BoxError, Error, Result};
pub use events::{new_event, Event, EventType, SPEC_VERSION};
pub use loopdetect::{compute_signature, detect_loop, pattern_key, LoopWarning};
pub use redact::{
    build_error_payload, normalize_usage, redact_argv, sanitize, ErrorSource, REDACTED_MARKER,
    TRUNCATED_MARKER,
};
pub use storage::{Counts, RunMeta, RunStatus, RunStore};
pub use trace::{
    clear_run_hooks, current_run, current_run_id, disable_implicit_run, enable_implicit_run,
    exit_on_terminate, record_llm_call, record_state, record_tool_call, register_run_enter,
    register_run_exit, shutdown, shutdown_guard, terminate, traced_run, traced_run_with,
    LlmCall, RunFailure, RunHandle, ShutdownGuard, StateUpdate, Terminate, ToolCall,
};
