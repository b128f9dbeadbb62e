//! Run-boundary callbacks for integrations.
//!
//! Enter hooks fire after RUN_START of an outermost run; exit hooks fire
//! before its RUN_END, so anything they record lands ahead of it. Nested
//! scopes never fire hooks. A hook that fails or panics is logged and
//! skipped; the remaining hooks still run and the run itself is unaffected.
//! A [`terminate`](crate::terminate) from inside a hook keeps unwinding.

use crate::error::BoxError;
use crate::trace::lifecycle::{RunFailure, Terminate};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

type EnterHook = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;
type ExitHook = Arc<dyn Fn(Option<&RunFailure>) -> Result<(), BoxError> + Send + Sync>;

#[derive(Default)]
struct Registry {
    enter: Vec<(String, EnterHook)>,
    exit: Vec<(String, ExitHook)>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

/// Register `hook` to run when an outermost run starts. A second
/// registration under the same name is ignored.
pub fn register_run_enter<F>(name: &str, hook: F)
where
    F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
{
    let mut registry = REGISTRY.lock();
    if registry.enter.iter().any(|(n, _)| n == name) {
        return;
    }
    registry.enter.push((name.to_string(), Arc::new(hook)));
}

/// Register `hook` to run when an outermost run exits. It receives the
/// failure that ended the run, or `None` on success. A second registration
/// under the same name is ignored.
pub fn register_run_exit<F>(name: &str, hook: F)
where
    F: Fn(Option<&RunFailure>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    let mut registry = REGISTRY.lock();
    if registry.exit.iter().any(|(n, _)| n == name) {
        return;
    }
    registry.exit.push((name.to_string(), Arc::new(hook)));
}

/// Drop every registered hook.
pub fn clear_run_hooks() {
    let mut registry = REGISTRY.lock();
    registry.enter.clear();
    registry.exit.clear();
}

// Hooks are cloned out of the registry first so a hook may itself register
// or clear hooks without deadlocking.

pub(crate) fn invoke_run_enter() {
    let hooks = REGISTRY.lock().enter.clone();
    for (name, hook) in hooks {
        isolate("enter", &name, || hook());
    }
}

pub(crate) fn invoke_run_exit(failure: Option<&RunFailure>) {
    let hooks = REGISTRY.lock().exit.clone();
    for (name, hook) in hooks {
        isolate("exit", &name, || hook(failure));
    }
}

fn isolate(kind: &str, name: &str, f: impl FnOnce() -> Result<(), BoxError>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(hook = name, kind, error = %err, "run hook failed");
        }
        Err(payload) if payload.is::<Terminate>() => resume_unwind(payload),
        Err(payload) => {
            let message = crate::trace::lifecycle::panic_message(payload.as_ref());
            tracing::warn!(hook = name, kind, panic = %message, "run hook panicked");
        }
    }
}
