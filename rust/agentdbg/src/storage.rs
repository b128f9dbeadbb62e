//! On-disk run store.
//!
//! ```text
//! <data_dir>/runs/<run_id>/run.json      run metadata, replaced atomically
//! <data_dir>/runs/<run_id>/events.jsonl  append-only event log
//! ```
//!
//! Every append is flushed and synced before returning. `run.json` is
//! written to a temp sibling and renamed into place so readers never see a
//! partial record. Run ids must be canonical v4 UUIDs before any path is
//! derived from them.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{elapsed_ms, parse_ts, utc_now_iso_ms_z, Event, SPEC_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};

pub const RUN_JSON: &str = "run.json";
pub const EVENTS_JSONL: &str = "events.jsonl";

const RUNS_DIR: &str = "runs";
const RUN_ID_MAX_LEN: usize = 36;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run work counters. Only ever incremented during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Counts {
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub errors: u64,
    pub loop_warnings: u64,
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default = "spec_version")]
    pub spec_version: String,
    pub run_id: String,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub counts: Counts,
    #[serde(default)]
    pub last_event_ts: Option<String>,
}

fn spec_version() -> String {
    SPEC_VERSION.to_string()
}

impl RunMeta {
    fn started(&self) -> Option<DateTime<Utc>> {
        parse_ts(&self.started_at)
    }
}

// ---------------------------------------------------------------------------
// Run id validation
// ---------------------------------------------------------------------------

/// Accept only canonical lowercase hyphenated v4 UUIDs.
pub fn validate_run_id(run_id: &str) -> Result<&str> {
    let invalid = || Error::InvalidRunId(run_id.to_string());
    if run_id.is_empty()
        || run_id.len() > RUN_ID_MAX_LEN
        || run_id.contains("..")
        || run_id.contains('/')
        || run_id.contains('\\')
    {
        return Err(invalid());
    }
    let parsed = uuid::Uuid::parse_str(run_id).map_err(|_| invalid())?;
    if parsed.get_version_num() != 4 || parsed.hyphenated().to_string() != run_id {
        return Err(invalid());
    }
    Ok(run_id)
}

fn has_traversal(s: &str) -> bool {
    s.contains("..") || s.contains('/') || s.contains('\\')
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Filesystem store rooted at `<data_dir>/runs`.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: data_dir.as_ref().join(RUNS_DIR),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Directory for `run_id`, validated to sit directly under the runs root.
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        let path = self.runs_dir.join(run_id);
        let relative = path
            .strip_prefix(&self.runs_dir)
            .map_err(|_| Error::InvalidRunId(run_id.to_string()))?;
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == run_id => {}
            _ => return Err(Error::InvalidRunId(run_id.to_string())),
        }
        // Symlinked run directories must still resolve inside the root.
        if let (Ok(resolved), Ok(base)) = (path.canonicalize(), self.runs_dir.canonicalize()) {
            if !resolved.starts_with(&base) {
                return Err(Error::InvalidRunId(run_id.to_string()));
            }
        }
        Ok(path)
    }

    pub fn run_json_path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(RUN_JSON))
    }

    pub fn events_path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self.run_dir(run_id)?.join(EVENTS_JSONL))
    }

    /// Allocate a run id, create its directory and write the initial
    /// `run.json` with status `running`.
    pub fn create_run(&self, run_name: Option<&str>) -> Result<RunMeta> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let dir = self.run_dir(&run_id)?;
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let meta = RunMeta {
            spec_version: spec_version(),
            run_id: run_id.clone(),
            run_name: run_name.map(str::to_string),
            started_at: utc_now_iso_ms_z(),
            ended_at: None,
            duration_ms: None,
            status: RunStatus::Running,
            counts: Counts::default(),
            last_event_ts: None,
        };
        write_json_atomic(&dir.join(RUN_JSON), &meta)?;
        tracing::debug!(run_id = %run_id, dir = %dir.display(), "created run");
        Ok(meta)
    }

    /// Append one event as a JSON line, then flush and sync.
    pub fn append_event(&self, run_id: &str, event: &Event) -> Result<()> {
        let path = self.events_path(run_id)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|e| Error::io(&path, e))
    }

    /// Close a run: stamp end time, duration, final status and counts.
    pub fn finalize_run(&self, run_id: &str, status: RunStatus, counts: &Counts) -> Result<RunMeta> {
        let path = self.run_json_path(run_id)?;
        if !path.is_file() {
            return Err(Error::NotFound(format!("run.json not found for run_id={run_id}")));
        }
        let mut meta = read_meta(&path)?;

        let now = Utc::now();
        let ended_at = crate::events::format_ts(now);
        meta.duration_ms = Some(elapsed_ms(&meta.started_at, now));
        meta.ended_at = Some(ended_at.clone());
        meta.status = status;
        meta.counts = *counts;
        meta.last_event_ts = Some(ended_at);

        write_json_atomic(&path, &meta)?;
        Ok(meta)
    }

    pub fn load_run_meta(&self, run_id: &str) -> Result<RunMeta> {
        let path = self.run_json_path(run_id)?;
        if !path.is_file() {
            return Err(Error::NotFound(format!("no run found for run_id '{run_id}'")));
        }
        read_meta(&path)
    }

    /// Read the event log back. Blank and malformed lines are skipped; a
    /// missing log reads as empty.
    pub fn load_events(&self, run_id: &str) -> Result<Vec<Event>> {
        let path = self.events_path(run_id)?;
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::io(&path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::debug!(run_id = %run_id, error = %err, "skipping malformed event line");
                }
            }
        }
        Ok(events)
    }

    /// Most recent runs first (by `started_at`), metadata only. Runs with a
    /// missing or unparsable start time sort last.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunMeta>> {
        let mut runs: Vec<RunMeta> = self
            .scan(|_| true)?
            .into_iter()
            .map(|(_, meta)| meta)
            .collect();
        sort_newest_first(&mut runs);
        runs.truncate(limit);
        Ok(runs)
    }

    /// Map a (possibly short) id prefix to a full run id. An exact match
    /// wins; otherwise the most recently started run among the prefix
    /// matches.
    pub fn resolve_run_id(&self, prefix: &str) -> Result<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() || has_traversal(prefix) {
            return Err(Error::NotFound("run ID is required".to_string()));
        }
        if !self.runs_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "no runs directory at {}",
                self.runs_dir.display()
            )));
        }

        let candidates = self.scan(|name| validate_run_id(name).is_ok() && name.starts_with(prefix))?;
        if let Some((id, _)) = candidates.iter().find(|(id, _)| id == prefix) {
            return Ok(id.clone());
        }
        let mut metas: Vec<RunMeta> = candidates
            .into_iter()
            .map(|(id, mut meta)| {
                meta.run_id = id;
                meta
            })
            .collect();
        sort_newest_first(&mut metas);
        metas
            .into_iter()
            .next()
            .map(|meta| meta.run_id)
            .ok_or_else(|| Error::NotFound(format!("no run found matching '{prefix}'")))
    }

    /// Run directories accepted by `filter` that hold a readable `run.json`,
    /// paired with their directory name.
    fn scan(&self, filter: impl Fn(&str) -> bool) -> Result<Vec<(String, RunMeta)>> {
        if !self.runs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.runs_dir).map_err(|e| Error::io(&self.runs_dir, e))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !filter(&name) {
                continue;
            }
            let run_json = path.join(RUN_JSON);
            if !run_json.is_file() {
                continue;
            }
            match read_meta(&run_json) {
                Ok(meta) => out.push((name, meta)),
                Err(err) => {
                    tracing::debug!(path = %run_json.display(), error = %err, "skipping unreadable run.json");
                }
            }
        }
        Ok(out)
    }
}

fn sort_newest_first(runs: &mut [RunMeta]) {
    runs.sort_by(|a, b| match (a.started(), b.started()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

fn read_meta(path: &Path) -> Result<RunMeta> {
    let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Write-to-temp then rename. The temp file is removed on failure.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(err) = written {
        fs::remove_file(&tmp).ok();
        return Err(Error::io(path, err));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
