//! Run lifecycle and recording.

pub mod context;
pub mod hooks;
pub mod lifecycle;
pub mod recorders;

pub use context::{
    current_run, current_run_id, disable_implicit_run, enable_implicit_run, shutdown,
    shutdown_guard, RunHandle, ShutdownGuard,
};
pub use hooks::{clear_run_hooks, register_run_enter, register_run_exit};
pub use lifecycle::{
    exit_on_terminate, terminate, traced_run, traced_run_with, RunFailure, Terminate,
};
pub use recorders::{record_llm_call, record_state, record_tool_call, LlmCall, StateUpdate, ToolCall};
