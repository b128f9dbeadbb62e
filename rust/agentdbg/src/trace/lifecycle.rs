//! Traced scopes: start or join a run around a closure.
//!
//! The outermost scope on a thread owns the run. It appends RUN_START,
//! fires enter hooks, runs the body, then on the way out fires exit hooks,
//! appends RUN_END and finalizes the run on disk. Inner scopes join the
//! active run and do none of that.
//!
//! An `Err` from the body is recorded as an ERROR event and handed back to
//! the caller unchanged. A panic is recorded the same way (type `panic`) and
//! then resumed. [`terminate`] is the exception: it unwinds straight
//! through every scope without recording anything.

use crate::config::Config;
use crate::error::Error;
use crate::redact::short_type_name;
use crate::storage::RunStatus;
use crate::trace::context::{active_run, resolve_run_name, ActiveGuard, RunState, SharedRun};
use crate::trace::hooks::{invoke_run_enter, invoke_run_exit};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe, Location};

pub const PANIC_ERROR_TYPE: &str = "panic";

// ---------------------------------------------------------------------------
// RunFailure
// ---------------------------------------------------------------------------

/// What ended a run unsuccessfully. Exit hooks receive it; the ERROR event
/// carries the same three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub error_type: String,
    pub message: String,
    pub stack: String,
}

impl RunFailure {
    /// The short type name of `E`, its display text, and its debug
    /// rendering as the stack.
    pub fn from_error<E: fmt::Debug + fmt::Display>(err: &E) -> Self {
        RunFailure {
            error_type: short_type_name(std::any::type_name::<E>()),
            message: err.to_string(),
            stack: format!("{err:?}"),
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let backtrace = Backtrace::capture();
        let stack = match backtrace.status() {
            BacktraceStatus::Captured => backtrace.to_string(),
            _ => String::new(),
        };
        RunFailure {
            error_type: PANIC_ERROR_TYPE.to_string(),
            message: panic_message(payload),
            stack,
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Human-readable text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(t) = payload.downcast_ref::<Terminate>() {
        t.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Unwind payload that bypasses run bookkeeping. Raised by [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminate {
    pub code: i32,
}

impl fmt::Display for Terminate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "terminate({})", self.code)
    }
}

/// Abandon every enclosing traced scope without ERROR, RUN_END or
/// finalize. Pair with [`exit_on_terminate`] at the top of `main` to turn it
/// into a process exit.
pub fn terminate(code: i32) -> ! {
    resume_unwind(Box::new(Terminate { code }))
}

/// Run `f`; a [`terminate`] escaping it exits the process with its code.
/// Any other panic keeps unwinding.
pub fn exit_on_terminate<T>(f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => match payload.downcast::<Terminate>() {
            Ok(t) => std::process::exit(t.code),
            Err(payload) => resume_unwind(payload),
        },
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Run `f` inside a traced run, loading configuration from the usual
/// layers. Without a name (and without `AGENTDBG_RUN_NAME`) the run is
/// named after the call site and the local time.
///
/// ```no_run
/// use agentdbg::{record_tool_call, traced_run, ToolCall};
///
/// let out: Result<u32, agentdbg::Error> = traced_run(Some("demo"), || {
///     record_tool_call(ToolCall::new("search").args(&["rust"]))?;
///     Ok(42)
/// });
/// ```
#[track_caller]
pub fn traced_run<T, E, F>(name: Option<&str>, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Debug + fmt::Display + From<Error>,
{
    run_scope(None, name, Location::caller(), f)
}

/// [`traced_run`] with an explicit configuration instead of the layered
/// one.
#[track_caller]
pub fn traced_run_with<T, E, F>(config: Config, name: Option<&str>, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Debug + fmt::Display + From<Error>,
{
    run_scope(Some(config), name, Location::caller(), f)
}

fn run_scope<T, E, F>(
    config: Option<Config>,
    name: Option<&str>,
    caller: &Location<'_>,
    f: F,
) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Debug + fmt::Display + From<Error>,
{
    if active_run().is_some() {
        tracing::debug!("joining active run");
        return f();
    }

    let config = config.unwrap_or_else(Config::load);
    let run = RunState::begin(config, resolve_run_name(name, Some(caller)))?;
    let _active = ActiveGuard::install(run.clone());
    run.lock().append_run_start()?;
    invoke_run_enter();

    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => {
            invoke_run_exit(None);
            run.lock().finish(RunStatus::Ok)?;
            Ok(value)
        }
        Ok(Err(err)) => {
            fail_run(&run, &RunFailure::from_error(&err));
            Err(err)
        }
        Err(payload) => {
            if payload.is::<Terminate>() {
                resume_unwind(payload);
            }
            fail_run(&run, &RunFailure::from_panic(payload.as_ref()));
            resume_unwind(payload)
        }
    }
}

/// ERROR, exit hooks, RUN_END, finalize. The caller's failure takes
/// precedence over storage errors here, so those are only logged.
fn fail_run(run: &SharedRun, failure: &RunFailure) {
    {
        let mut state = run.lock();
        if let Err(err) = state.append_error(&failure.error_type, &failure.message, &failure.stack) {
            tracing::warn!(run_id = %state.run_id, error = %err, "failed to record run error");
        }
    }
    invoke_run_exit(Some(failure));
    let mut state = run.lock();
    if let Err(err) = state.finish(RunStatus::Error) {
        tracing::warn!(run_id = %state.run_id, error = %err, "failed to finalize failed run");
    }
}
