//! Implicit-run startup when the data directory is unusable. Separate binary:
//! the implicit run is process-global.

use agentdbg::{
    current_run_id, enable_implicit_run, record_tool_call, shutdown, Config, EventType, RunStore,
    ToolCall,
};

#[test]
fn failed_start_is_retried_on_the_next_record() {
    let dir = std::env::temp_dir().join(format!("agentdbg-implicit-fail-{}", uuid::Uuid::new_v4()));
    std::fs::write(&dir, b"not a directory").unwrap();
    enable_implicit_run(Some(Config::default().with_data_dir(&dir)));

    assert!(record_tool_call(ToolCall::new("first")).is_err());
    assert!(current_run_id().is_none());
    assert!(record_tool_call(ToolCall::new("second")).is_err());
    assert!(current_run_id().is_none());

    std::fs::remove_file(&dir).unwrap();
    record_tool_call(ToolCall::new("third")).unwrap();
    let run_id = current_run_id().expect("implicit run started once storage works");
    shutdown();

    let events = RunStore::new(&dir).load_events(&run_id).unwrap();
    let kinds: Vec<(EventType, &str)> = events.iter().map(|e| (e.event_type, e.name.as_str())).collect();
    assert_eq!(kinds[0].0, EventType::RunStart);
    assert_eq!(kinds[1], (EventType::ToolCall, "third"));
    assert_eq!(kinds[2].0, EventType::RunEnd);
    assert_eq!(kinds.len(), 3);

    std::fs::remove_dir_all(&dir).ok();
}
