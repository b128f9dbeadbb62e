//! agentdbg CLI: list and export recorded runs.

use agentdbg::{Config, RunMeta, RunStore, SPEC_VERSION};
use clap::{Parser as ClapParser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};

const EXIT_NOT_FOUND: i32 = 2;
const EXIT_INTERNAL: i32 = 10;

const LOG_ENV: &str = "AGENTDBG_LOG";

fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}

#[derive(ClapParser)]
#[command(name = "agentdbg", version, about = "Inspect runs recorded by agentdbg")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recent runs, newest first
    List {
        /// Maximum number of runs to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        /// Print machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Export one run (metadata and events) to a JSON file
    Export {
        /// Run ID or a unique prefix of one
        run_id: String,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Trace(#[from] agentdbg::Error),
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Trace(e) if e.is_not_found() || e.is_validation() => EXIT_NOT_FOUND,
            _ => EXIT_INTERNAL,
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let (result, quiet) = match cli.command {
        Commands::List { limit, json } => (cmd_list(limit, json), json),
        Commands::Export { run_id, out } => (cmd_export(&run_id, &out), false),
    };

    if let Err(e) = result {
        let code = e.exit_code();
        if !quiet || code != EXIT_INTERNAL {
            eprintln!("{} {}", red("error:"), e);
        }
        std::process::exit(code);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn store() -> RunStore {
    RunStore::from_config(&Config::load())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn cmd_list(limit: usize, as_json: bool) -> Result<(), CliError> {
    let runs = store().list_runs(limit)?;
    if as_json {
        let out = json!({ "spec_version": SPEC_VERSION, "runs": runs });
        println!("{}", serde_json::to_string(&out)?);
    } else {
        println!("{}", format_runs_table(&runs));
    }
    Ok(())
}

const HEADERS: [&str; 7] = [
    "run_id",
    "run_name",
    "started_at",
    "duration_ms",
    "llm_calls",
    "tool_calls",
    "status",
];

fn run_row(run: &RunMeta) -> [String; 7] {
    [
        run.run_id.chars().take(8).collect(),
        run.run_name.clone().unwrap_or_default(),
        run.started_at.clone(),
        run.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
        run.counts.llm_calls.to_string(),
        run.counts.tool_calls.to_string(),
        run.status.to_string(),
    ]
}

/// Tab-separated, each column padded to its widest cell.
fn format_runs_table(runs: &[RunMeta]) -> String {
    if runs.is_empty() {
        return format!("{}\n", HEADERS.join("\t"));
    }
    let rows: Vec<[String; 7]> = runs.iter().map(run_row).collect();
    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let render = |cells: &[&str]| -> String {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("\t")
    };
    let mut lines = vec![render(&HEADERS[..])];
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        lines.push(render(&cells));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// export
// ---------------------------------------------------------------------------

fn cmd_export(run_id: &str, out: &Path) -> Result<(), CliError> {
    let store = store();
    let run_id = store.resolve_run_id(run_id)?;
    let run = store.load_run_meta(&run_id)?;
    let events = store.load_events(&run_id)?;
    let payload = json!({
        "spec_version": SPEC_VERSION,
        "run": run,
        "events": events,
    });
    let text = serde_json::to_string_pretty(&payload)?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| CliError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(out, text).map_err(|source| CliError::Write {
        path: out.to_path_buf(),
        source,
    })?;
    tracing::debug!(run_id = %run_id, out = %out.display(), "exported run");
    Ok(())
}
