//! Run lifecycle: start, join, error and panic exits, termination.

use agentdbg::{
    current_run_id, record_llm_call, record_tool_call, terminate, traced_run, traced_run_with,
    Config, Error, Event, EventType, LlmCall, RunMeta, RunStatus, RunStore, Terminate, ToolCall,
    REDACTED_MARKER,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

struct TempData {
    dir: PathBuf,
}

impl TempData {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("agentdbg-lifecycle-{}", uuid::Uuid::new_v4()));
        TempData { dir }
    }

    fn config(&self) -> Config {
        Config::default().with_data_dir(&self.dir)
    }

    fn store(&self) -> RunStore {
        RunStore::new(&self.dir)
    }

    /// The single run recorded under this directory.
    fn only_run(&self) -> (RunMeta, Vec<Event>) {
        let store = self.store();
        let runs = store.list_runs(10).expect("list runs");
        assert_eq!(runs.len(), 1, "expected exactly one run, got {runs:?}");
        let meta = runs.into_iter().next().unwrap();
        let events = store.load_events(&meta.run_id).expect("load events");
        (meta, events)
    }
}

impl Drop for TempData {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

fn types(events: &[Event]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("tool exploded: {0}")]
    Tool(String),
    #[error(transparent)]
    Trace(#[from] Error),
}

// ===========================================================================
// Normal exit
// ===========================================================================

#[test]
fn ok_run_writes_start_calls_end_and_finalizes() {
    let data = TempData::new();
    let out = traced_run_with(data.config(), Some("ok-run"), || {
        record_tool_call(ToolCall::new("search").args(serde_json::json!({"q": "rust"})))?;
        record_llm_call(LlmCall::new("gpt-4").prompt("hi").response("hello"))?;
        Ok::<_, Error>(7)
    })
    .expect("run should succeed");
    assert_eq!(out, 7);

    let (meta, events) = data.only_run();
    assert_eq!(
        types(&events),
        vec![
            EventType::RunStart,
            EventType::ToolCall,
            EventType::LlmCall,
            EventType::RunEnd
        ]
    );
    assert_eq!(meta.status, RunStatus::Ok);
    assert_eq!(meta.counts.tool_calls, 1);
    assert_eq!(meta.counts.llm_calls, 1);
    assert_eq!(meta.counts.errors, 0);
    assert!(meta.ended_at.is_some());
    assert!(meta.duration_ms.is_some());

    let end = events.last().unwrap();
    assert_eq!(end.name, "run_end");
    assert_eq!(end.payload["status"], "ok");
    assert_eq!(end.payload["summary"]["tool_calls"], 1);
    assert_eq!(end.payload["summary"]["llm_calls"], 1);
    assert!(events.iter().all(|e| e.run_id == meta.run_id));
    assert!(current_run_id().is_none());
}

#[test]
fn run_start_payload_describes_the_process() {
    let data = TempData::new();
    traced_run_with(data.config(), Some("env-check"), || Ok::<_, Error>(())).unwrap();

    let (meta, events) = data.only_run();
    let start = &events[0];
    assert_eq!(start.event_type, EventType::RunStart);
    assert_eq!(start.name, meta.run_name.clone().unwrap());
    let payload = start.payload.as_object().unwrap();
    for key in ["run_name", "rust_version", "platform", "cwd", "argv"] {
        assert!(payload.contains_key(key), "RUN_START missing {key}");
    }
    assert_eq!(payload["platform"], std::env::consts::OS);
    assert!(payload["argv"].is_array());
}

#[test]
fn default_name_comes_from_call_site() {
    if std::env::var("AGENTDBG_RUN_NAME").is_ok() {
        return;
    }
    let data = TempData::new();
    traced_run_with(data.config(), None, || Ok::<_, Error>(())).unwrap();
    let (meta, _) = data.only_run();
    let name = meta.run_name.unwrap();
    assert!(name.contains("lifecycle.rs:"), "unexpected default name {name}");
}

// ===========================================================================
// Nesting
// ===========================================================================

#[test]
fn nested_scopes_share_one_run() {
    let data = TempData::new();
    traced_run_with(data.config(), Some("outer"), || {
        let outer_id = current_run_id();
        record_tool_call(ToolCall::new("a"))?;
        traced_run(Some("inner"), || {
            assert_eq!(current_run_id(), outer_id);
            record_llm_call(LlmCall::new("m"))
        })?;
        record_tool_call(ToolCall::new("b"))?;
        Ok::<_, Error>(())
    })
    .unwrap();

    let (meta, events) = data.only_run();
    assert_eq!(
        types(&events),
        vec![
            EventType::RunStart,
            EventType::ToolCall,
            EventType::LlmCall,
            EventType::ToolCall,
            EventType::RunEnd
        ]
    );
    let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(&names[1..4], &["a", "m", "b"]);
    assert_eq!(meta.counts.tool_calls, 2);
    assert_eq!(meta.counts.llm_calls, 1);
}

#[test]
fn inner_error_is_recorded_once_by_the_outer_run() {
    let data = TempData::new();
    let result: Result<(), AgentError> = traced_run_with(data.config(), Some("outer"), || {
        traced_run(None, || Err(AgentError::Tool("inner".into())))
    });
    assert!(matches!(result, Err(AgentError::Tool(_))));

    let (meta, events) = data.only_run();
    let errors = events.iter().filter(|e| e.event_type == EventType::Error).count();
    assert_eq!(errors, 1);
    assert_eq!(meta.counts.errors, 1);
}

// ===========================================================================
// Failing exits
// ===========================================================================

#[test]
fn error_is_recorded_and_returned_unchanged() {
    let data = TempData::new();
    let result = traced_run_with(data.config(), Some("failing"), || {
        record_tool_call(ToolCall::new("explode"))?;
        Err::<(), _>(AgentError::Tool("boom".into()))
    });
    match result {
        Err(AgentError::Tool(msg)) => assert_eq!(msg, "boom"),
        other => panic!("expected the tool error back, got {other:?}"),
    }

    let (meta, events) = data.only_run();
    assert_eq!(
        types(&events),
        vec![
            EventType::RunStart,
            EventType::ToolCall,
            EventType::Error,
            EventType::RunEnd
        ]
    );
    let error = &events[2];
    assert_eq!(error.name, "AgentError");
    assert_eq!(error.payload["error_type"], "AgentError");
    assert_eq!(error.payload["message"], "tool exploded: boom");
    assert!(error.payload["stack"].as_str().unwrap().contains("Tool"));

    assert_eq!(events[3].payload["status"], "error");
    assert_eq!(events[3].payload["summary"]["errors"], 1);
    assert_eq!(meta.status, RunStatus::Error);
    assert_eq!(meta.counts.errors, 1);
}

#[test]
fn panic_is_recorded_then_resumed() {
    let data = TempData::new();
    let config = data.config();
    let caught = catch_unwind(AssertUnwindSafe(|| {
        traced_run_with(config, Some("panicky"), || -> Result<(), Error> {
            panic!("agent blew up");
        })
    }));
    let payload = caught.expect_err("panic should propagate");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"agent blew up"));
    assert!(current_run_id().is_none());

    let (meta, events) = data.only_run();
    assert_eq!(
        types(&events),
        vec![EventType::RunStart, EventType::Error, EventType::RunEnd]
    );
    assert_eq!(events[1].name, "panic");
    assert_eq!(events[1].payload["message"], "agent blew up");
    assert_eq!(meta.status, RunStatus::Error);
    assert_eq!(meta.counts.errors, 1);
}

#[test]
fn terminate_skips_error_and_finalize() {
    let data = TempData::new();
    let config = data.config();
    let caught = catch_unwind(AssertUnwindSafe(|| {
        traced_run_with(config, Some("terminated"), || -> Result<(), Error> {
            record_tool_call(ToolCall::new("last"))?;
            terminate(3)
        })
    }));
    let payload = caught.expect_err("terminate should unwind");
    assert_eq!(payload.downcast_ref::<Terminate>(), Some(&Terminate { code: 3 }));

    let (meta, events) = data.only_run();
    assert_eq!(types(&events), vec![EventType::RunStart, EventType::ToolCall]);
    assert_eq!(meta.status, RunStatus::Running);
    assert!(meta.ended_at.is_none());
}

#[test]
fn secrets_in_error_text_never_reach_disk() {
    let data = TempData::new();
    let mut config = data.config();
    config.redact_keys.extend(["message".to_string(), "stack".to_string()]);
    let secret = "sk-live-0123456789abcdef";

    let result = traced_run_with(config, Some("leaky"), || {
        Err::<(), _>(AgentError::Tool(format!("auth failed with {secret}")))
    });
    assert!(result.is_err());

    let (meta, events) = data.only_run();
    let error = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("ERROR event");
    assert_eq!(error.payload["message"], REDACTED_MARKER);
    assert_eq!(error.payload["stack"], REDACTED_MARKER);

    let raw = std::fs::read_to_string(data.store().events_path(&meta.run_id).unwrap()).unwrap();
    assert!(!raw.contains(secret));
}

#[test]
fn storage_failure_at_start_skips_the_body() {
    let data = TempData::new();
    std::fs::write(&data.dir, b"not a directory").unwrap();
    let mut ran = false;
    let result = traced_run_with(data.config(), Some("nowhere"), || {
        ran = true;
        Ok::<_, Error>(())
    });
    assert!(matches!(result, Err(Error::Io { .. })));
    assert!(!ran);
    assert!(current_run_id().is_none());
    std::fs::remove_file(&data.dir).ok();
}
