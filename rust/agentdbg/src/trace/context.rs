//! Ambient run state.
//!
//! Explicit runs live in a thread-local slot that traced scopes push on
//! entry and restore on exit. The implicit run lives in process-scoped state
//! of its own and is never published into that slot, so it cannot leak into a
//! later explicit scope. Each run's mutable state sits behind its own mutex.

use crate::config::Config;
use crate::error::Result;
use crate::events::{elapsed_ms, new_event, Event, EventType};
use crate::loopdetect::{detect_loop, pattern_key};
use crate::redact::{redact_argv, sanitize};
use crate::storage::{Counts, RunMeta, RunStatus, RunStore};
use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::panic::Location;
use std::sync::Arc;

pub const ENV_RUN_NAME: &str = "AGENTDBG_RUN_NAME";
pub const ENV_IMPLICIT_RUN: &str = "AGENTDBG_IMPLICIT_RUN";

pub(crate) const IMPLICIT_RUN_NAME: &str = "implicit";
const RUN_END_NAME: &str = "run_end";
const LOOP_WARNING_NAME_MAX: usize = 80;

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

pub(crate) struct RunState {
    pub(crate) run_id: String,
    pub(crate) run_name: String,
    pub(crate) started_at: String,
    pub(crate) counts: Counts,
    pub(crate) config: Arc<Config>,
    store: RunStore,
    window: VecDeque<Event>,
    warned: HashSet<String>,
}

pub(crate) type SharedRun = Arc<Mutex<RunState>>;

impl RunState {
    /// Create the run on disk (status `running`) with fresh in-memory state.
    /// RUN_START is appended separately so the caller can publish the run
    /// first.
    pub(crate) fn begin(config: Config, run_name: String) -> Result<SharedRun> {
        let store = RunStore::from_config(&config);
        let meta = store.create_run(Some(&run_name))?;
        tracing::debug!(run_id = %meta.run_id, run_name = %run_name, "run started");
        Ok(Arc::new(Mutex::new(RunState {
            run_id: meta.run_id,
            run_name,
            started_at: meta.started_at,
            counts: Counts::default(),
            config: Arc::new(config),
            store,
            window: VecDeque::new(),
            warned: HashSet::new(),
        })))
    }

    pub(crate) fn append_run_start(&mut self) -> Result<()> {
        let payload = run_start_payload(&self.run_name, &self.config);
        let name = self.run_name.clone();
        self.append(EventType::RunStart, &name, payload)
    }

    pub(crate) fn append_error(&mut self, error_type: &str, message: &str, stack: &str) -> Result<()> {
        let payload = sanitize(
            &json!({
                "error_type": error_type,
                "message": message,
                "stack": stack,
            }),
            &self.config,
        );
        self.append(EventType::Error, error_type, payload)?;
        self.counts.errors += 1;
        Ok(())
    }

    /// Append RUN_END and close the run on disk.
    pub(crate) fn finish(&mut self, status: RunStatus) -> Result<RunMeta> {
        let payload = run_end_payload(status, &self.counts, &self.started_at);
        self.append(EventType::RunEnd, RUN_END_NAME, payload)?;
        let meta = self.store.finalize_run(&self.run_id, status, &self.counts)?;
        tracing::debug!(run_id = %self.run_id, status = %status, "run finalized");
        Ok(meta)
    }

    /// Record one call or state event: sanitize, persist, count, slide the
    /// window and check it for loops.
    pub(crate) fn record(
        &mut self,
        event_type: EventType,
        name: &str,
        payload: Value,
        meta: Value,
    ) -> Result<()> {
        let payload = sanitize(&payload, &self.config);
        let meta = sanitize(&meta, &self.config);
        let event = new_event(event_type, &self.run_id, name, payload).with_meta(meta);
        self.store.append_event(&self.run_id, &event)?;

        match event_type {
            EventType::LlmCall => self.counts.llm_calls += 1,
            EventType::ToolCall => self.counts.tool_calls += 1,
            _ => {}
        }

        self.window.push_back(event);
        while self.window.len() > self.config.loop_window {
            self.window.pop_front();
        }
        self.maybe_warn_loop()
    }

    fn maybe_warn_loop(&mut self) -> Result<()> {
        let window: &[Event] = self.window.make_contiguous();
        let Some(warning) = detect_loop(window, self.config.loop_window, self.config.loop_repetitions)
        else {
            return Ok(());
        };
        let key = pattern_key(&warning);
        if self.warned.contains(&key) {
            return Ok(());
        }

        let name = loop_warning_name(&warning.pattern);
        tracing::debug!(run_id = %self.run_id, pattern = %warning.pattern, "loop detected");
        let payload = serde_json::to_value(&warning)?;
        self.append(EventType::LoopWarning, &name, payload)?;
        self.counts.loop_warnings += 1;
        self.warned.insert(key);
        Ok(())
    }

    fn append(&mut self, event_type: EventType, name: &str, payload: Value) -> Result<()> {
        let event = new_event(event_type, &self.run_id, name, payload);
        self.store.append_event(&self.run_id, &event)
    }
}

fn loop_warning_name(pattern: &str) -> String {
    if pattern.chars().count() <= LOOP_WARNING_NAME_MAX {
        return pattern.to_string();
    }
    let head: String = pattern.chars().take(LOOP_WARNING_NAME_MAX - 1).collect();
    format!("{head}...")
}

// ---------------------------------------------------------------------------
// Payloads and names
// ---------------------------------------------------------------------------

/// Env override, then the explicit name, then call site plus local time.
pub(crate) fn resolve_run_name(explicit: Option<&str>, caller: Option<&Location<'_>>) -> String {
    if let Ok(env_name) = std::env::var(ENV_RUN_NAME) {
        let env_name = env_name.trim();
        if !env_name.is_empty() {
            return env_name.to_string();
        }
    }
    if let Some(name) = explicit.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let stamp = Local::now().format("%Y-%m-%d %H:%M");
    match caller {
        Some(loc) => format!("{}:{} - {stamp}", loc.file(), loc.line()),
        None => format!("run - {stamp}"),
    }
}

fn run_start_payload(run_name: &str, config: &Config) -> Value {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let argv: Vec<String> = std::env::args().collect();
    let payload = json!({
        "run_name": run_name,
        "rust_version": env!("AGENTDBG_RUSTC_VERSION"),
        "platform": std::env::consts::OS,
        "cwd": cwd,
        "argv": redact_argv(&argv, config),
    });
    sanitize(&payload, config)
}

fn run_end_payload(status: RunStatus, counts: &Counts, started_at: &str) -> Value {
    json!({
        "status": status.as_str(),
        "summary": {
            "llm_calls": counts.llm_calls,
            "tool_calls": counts.tool_calls,
            "errors": counts.errors,
            "duration_ms": elapsed_ms(started_at, Utc::now()),
        },
    })
}

// ---------------------------------------------------------------------------
// Explicit context
// ---------------------------------------------------------------------------

thread_local! {
    static ACTIVE: RefCell<Option<SharedRun>> = const { RefCell::new(None) };
}

/// The explicit run active on this thread, if any.
pub(crate) fn active_run() -> Option<SharedRun> {
    ACTIVE.with(|slot| slot.borrow().clone())
}

/// Restores the previously active run when dropped.
pub(crate) struct ActiveGuard {
    prev: Option<SharedRun>,
}

impl ActiveGuard {
    pub(crate) fn install(run: SharedRun) -> Self {
        let prev = ACTIVE.with(|slot| slot.borrow_mut().replace(run));
        ActiveGuard { prev }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = ACTIVE.try_with(|slot| *slot.borrow_mut() = prev);
    }
}

/// A handle on a live run, for carrying it onto another thread.
#[derive(Clone)]
pub struct RunHandle {
    run: SharedRun,
}

impl RunHandle {
    pub fn run_id(&self) -> String {
        self.run.lock().run_id.clone()
    }

    /// Make this run the ambient run on the calling thread while `f` runs.
    /// Recorders called from `f` land in this run; the previous ambient run
    /// is restored afterwards.
    pub fn attach<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = ActiveGuard::install(self.run.clone());
        f()
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").field("run_id", &self.run_id()).finish()
    }
}

/// Handle on the run recorders would use right now: the explicit run on
/// this thread, else the implicit run if one has already started.
pub fn current_run() -> Option<RunHandle> {
    if let Some(run) = active_run() {
        return Some(RunHandle { run });
    }
    IMPLICIT.lock().run.clone().map(|run| RunHandle { run })
}

pub fn current_run_id() -> Option<String> {
    current_run().map(|handle| handle.run_id())
}

// ---------------------------------------------------------------------------
// Implicit run
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ImplicitState {
    /// Programmatic override of the environment opt-in.
    enabled: Option<bool>,
    config: Option<Config>,
    run: Option<SharedRun>,
}

impl ImplicitState {
    fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or_else(|| {
            std::env::var(ENV_IMPLICIT_RUN)
                .map(|v| v.trim() == "1")
                .unwrap_or(false)
        })
    }

    /// Make `run` the implicit run once its RUN_START is on disk.
    fn publish(&mut self, run: SharedRun) -> Result<SharedRun> {
        run.lock().append_run_start()?;
        self.run = Some(run.clone());
        Ok(run)
    }
}

static IMPLICIT: Lazy<Mutex<ImplicitState>> = Lazy::new(|| Mutex::new(ImplicitState::default()));

/// Opt in to the implicit run. `config` replaces the layered configuration
/// for the implicit run when given.
pub fn enable_implicit_run(config: Option<Config>) {
    let mut state = IMPLICIT.lock();
    state.enabled = Some(true);
    state.config = config;
}

/// Opt out, overriding `AGENTDBG_IMPLICIT_RUN`. An implicit run that already
/// started is left for [`shutdown`].
pub fn disable_implicit_run() {
    IMPLICIT.lock().enabled = Some(false);
}

/// The run recorders should write to: the explicit run first, then the
/// implicit run, started on first use when enabled.
pub(crate) fn ensure_run() -> Result<Option<SharedRun>> {
    if let Some(run) = active_run() {
        return Ok(Some(run));
    }

    let mut state = IMPLICIT.lock();
    if let Some(run) = &state.run {
        return Ok(Some(run.clone()));
    }
    if !state.is_enabled() {
        return Ok(None);
    }

    let config = state.config.clone().unwrap_or_else(Config::load);
    let run = RunState::begin(config, resolve_run_name(Some(IMPLICIT_RUN_NAME), None))?;
    state.publish(run).map(Some)
}

/// Finalize the implicit run, if one is open, with status `ok`. Failures
/// are logged and otherwise ignored. Safe to call more than once.
pub fn shutdown() {
    let Some(run) = IMPLICIT.lock().run.take() else {
        return;
    };
    let mut run = run.lock();
    if let Err(err) = run.finish(RunStatus::Ok) {
        tracing::warn!(run_id = %run.run_id, error = %err, "failed to finalize implicit run");
    }
}

/// Calls [`shutdown`] when dropped. Hold it at the top of `main`.
#[must_use = "the implicit run is finalized when the guard is dropped"]
pub struct ShutdownGuard {
    _private: (),
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        shutdown();
    }
}

pub fn shutdown_guard() -> ShutdownGuard {
    ShutdownGuard { _private: () }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (std::path::PathBuf, Config) {
        let base = std::env::temp_dir().join(format!("agentdbg-ctx-test-{}", uuid::Uuid::new_v4()));
        let config = Config {
            loop_window: 6,
            loop_repetitions: 3,
            ..Config::default()
        }
        .with_data_dir(&base);
        (base, config)
    }

    #[test]
    fn loop_warning_name_is_capped() {
        assert_eq!(loop_warning_name("TOOL_CALL:a"), "TOOL_CALL:a");
        let long = "x".repeat(120);
        let name = loop_warning_name(&long);
        assert_eq!(name.chars().count(), 82);
        assert!(name.ends_with("..."));
        assert!(name.starts_with(&"x".repeat(79)));
    }

    #[test]
    fn run_name_falls_back_to_call_site() {
        if std::env::var(ENV_RUN_NAME).is_ok() {
            return;
        }
        assert_eq!(resolve_run_name(Some("mine"), None), "mine");
        assert!(resolve_run_name(None, None).starts_with("run - "));
        let here = Location::caller();
        let name = resolve_run_name(None, Some(here));
        assert!(name.starts_with(&format!("{}:{} - ", here.file(), here.line())), "got {name}");
    }

    #[test]
    fn run_end_summary_carries_counts() {
        let counts = Counts {
            llm_calls: 1,
            tool_calls: 2,
            errors: 3,
            loop_warnings: 4,
        };
        let payload = run_end_payload(RunStatus::Error, &counts, "garbage");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["summary"]["tool_calls"], 2);
        assert_eq!(payload["summary"]["errors"], 3);
        assert_eq!(payload["summary"]["duration_ms"], 0);
        assert!(payload["summary"].get("loop_warnings").is_none());
    }

    #[test]
    fn window_keeps_last_events_and_warns_once() {
        let (base, config) = temp_config();
        let run = RunState::begin(config, "window".into()).unwrap();
        let mut state = run.lock();
        for _ in 0..5 {
            state
                .record(EventType::ToolCall, "t", json!({"tool_name": "t"}), json!({}))
                .unwrap();
        }
        assert_eq!(state.window.len(), 5);
        assert_eq!(state.counts.tool_calls, 5);
        assert_eq!(state.counts.loop_warnings, 1);

        for _ in 0..4 {
            state
                .record(EventType::StateUpdate, "state", json!({}), json!({}))
                .unwrap();
        }
        assert_eq!(state.window.len(), 6);
        assert_eq!(state.counts.tool_calls, 5);
        // STATE_UPDATE x3 is a second, distinct pattern.
        assert_eq!(state.counts.loop_warnings, 2);

        let events = state.store.load_events(&state.run_id).unwrap();
        let warnings = events
            .iter()
            .filter(|e| e.event_type == EventType::LoopWarning)
            .count();
        assert_eq!(warnings, 2);
        drop(state);
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn implicit_run_is_not_published_without_run_start() {
        let (base, config) = temp_config();
        let run = RunState::begin(config, IMPLICIT_RUN_NAME.into()).unwrap();
        std::fs::remove_dir_all(&base).unwrap();

        let mut state = ImplicitState::default();
        assert!(state.publish(run).is_err());
        assert!(state.run.is_none());
    }

    #[test]
    fn attach_restores_previous_run() {
        let (base, config) = temp_config();
        let outer = RunState::begin(config.clone(), "outer".into()).unwrap();
        let inner = RunState::begin(config, "inner".into()).unwrap();
        let outer_id = outer.lock().run_id.clone();
        let inner_id = inner.lock().run_id.clone();

        assert!(active_run().is_none());
        let _guard = ActiveGuard::install(outer);
        let handle = RunHandle { run: inner };
        let seen = handle.attach(current_run_id);
        assert_eq!(seen.as_deref(), Some(inner_id.as_str()));
        assert_eq!(current_run_id().as_deref(), Some(outer_id.as_str()));
        drop(_guard);
        assert!(active_run().is_none());

        std::fs::remove_dir_all(&base).unwrap();
    }
}
