//! Runtime configuration: redaction, truncation, loop detection and the
//! data directory.
//!
//! Sources are layered, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `~/.agentdbg/config.toml`
//! 3. `<project root>/.agentdbg/config.toml`
//! 4. `AGENTDBG_*` environment variables (only those actually set)
//!
//! Every key is applied on its own: a value of the wrong type is ignored and
//! the lower layer's value survives. A configuration is loaded once per run
//! and never changes afterwards.

use std::path::{Path, PathBuf};

pub const DEFAULT_REDACT_KEYS: &[&str] = &[
    "api_key",
    "token",
    "authorization",
    "cookie",
    "secret",
    "password",
];
pub const DEFAULT_MAX_FIELD_BYTES: usize = 20_000;
pub const DEFAULT_LOOP_WINDOW: usize = 12;
pub const DEFAULT_LOOP_REPETITIONS: usize = 3;

pub const MIN_MAX_FIELD_BYTES: usize = 100;
pub const MIN_LOOP_WINDOW: usize = 4;
pub const MIN_LOOP_REPETITIONS: usize = 2;

pub const ENV_REDACT: &str = "AGENTDBG_REDACT";
pub const ENV_REDACT_KEYS: &str = "AGENTDBG_REDACT_KEYS";
pub const ENV_MAX_FIELD_BYTES: &str = "AGENTDBG_MAX_FIELD_BYTES";
pub const ENV_LOOP_WINDOW: &str = "AGENTDBG_LOOP_WINDOW";
pub const ENV_LOOP_REPETITIONS: &str = "AGENTDBG_LOOP_REPETITIONS";
pub const ENV_DATA_DIR: &str = "AGENTDBG_DATA_DIR";

const CONFIG_DIR: &str = ".agentdbg";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Replace values under sensitive-looking keys with the redaction marker.
    pub redact: bool,
    /// Case-insensitive substrings that mark a key as sensitive.
    pub redact_keys: Vec<String>,
    /// Byte budget for any single string field, marker included.
    pub max_field_bytes: usize,
    /// Number of recent events the loop detector looks at.
    pub loop_window: usize,
    /// Consecutive repeats of a pattern that count as a loop.
    pub loop_repetitions: usize,
    /// Root of the on-disk run store (`<data_dir>/runs/...`).
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redact: true,
            redact_keys: DEFAULT_REDACT_KEYS.iter().map(|k| k.to_string()).collect(),
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            loop_window: DEFAULT_LOOP_WINDOW,
            loop_repetitions: DEFAULT_LOOP_REPETITIONS,
            data_dir: default_data_dir(dirs::home_dir().as_deref()),
        }
    }
}

impl Config {
    /// Load the layered configuration for the current process: the project
    /// root is the working directory, the home directory is the platform one.
    pub fn load() -> Self {
        let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_layered(&root, dirs::home_dir().as_deref(), |key| std::env::var(key).ok())
    }

    /// Load with every source made explicit.
    pub fn load_layered(
        project_root: &Path,
        home: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut config = Config {
            data_dir: default_data_dir(home),
            ..Config::default()
        };

        if let Some(home) = home {
            if let Some(table) = read_table(&home.join(CONFIG_DIR).join(CONFIG_FILE)) {
                config.apply_table(&table, Some(home));
            }
        }
        if let Some(table) = read_table(&project_root.join(CONFIG_DIR).join(CONFIG_FILE)) {
            config.apply_table(&table, home);
        }
        config.apply_env(env, home);
        config
    }

    /// Parse a TOML document over the defaults (useful for embedding and tests).
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let table: toml::Table = toml::from_str(s)?;
        let mut config = Config::default();
        config.apply_table(&table, dirs::home_dir().as_deref());
        Ok(config)
    }

    /// Same configuration rooted at another data directory.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    fn apply_table(&mut self, table: &toml::Table, home: Option<&Path>) {
        if let Some(value) = table.get("redact") {
            match value {
                toml::Value::Boolean(b) => self.redact = *b,
                toml::Value::Integer(n) => self.redact = *n != 0,
                _ => {}
            }
        }
        if let Some(toml::Value::Array(items)) = table.get("redact_keys") {
            let keys: Option<Vec<String>> = items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect();
            if let Some(keys) = keys {
                self.redact_keys = keys;
            }
        }
        if let Some(n) = table.get("max_field_bytes").and_then(toml_usize) {
            self.max_field_bytes = n.max(MIN_MAX_FIELD_BYTES);
        }
        if let Some(n) = table.get("loop_window").and_then(toml_usize) {
            self.loop_window = n.max(MIN_LOOP_WINDOW);
        }
        if let Some(n) = table.get("loop_repetitions").and_then(toml_usize) {
            self.loop_repetitions = n.max(MIN_LOOP_REPETITIONS);
        }
        if let Some(toml::Value::String(dir)) = table.get("data_dir") {
            self.data_dir = expand_tilde(dir, home);
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>, home: Option<&Path>) {
        if let Some(raw) = env(ENV_REDACT) {
            self.redact = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = env(ENV_REDACT_KEYS) {
            self.redact_keys = raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(n) = env(ENV_MAX_FIELD_BYTES).and_then(|raw| parse_usize(&raw)) {
            self.max_field_bytes = n.max(MIN_MAX_FIELD_BYTES);
        }
        if let Some(n) = env(ENV_LOOP_WINDOW).and_then(|raw| parse_usize(&raw)) {
            self.loop_window = n.max(MIN_LOOP_WINDOW);
        }
        if let Some(n) = env(ENV_LOOP_REPETITIONS).and_then(|raw| parse_usize(&raw)) {
            self.loop_repetitions = n.max(MIN_LOOP_REPETITIONS);
        }
        if let Some(raw) = env(ENV_DATA_DIR) {
            let raw = raw.trim();
            if !raw.is_empty() {
                self.data_dir = expand_tilde(raw, home);
            }
        }
    }
}

fn read_table(path: &Path) -> Option<toml::Table> {
    if !path.is_file() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cannot read config file");
            return None;
        }
    };
    match toml::from_str::<toml::Table>(&content) {
        Ok(table) => Some(table),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "invalid toml in config file");
            None
        }
    }
}

/// Negative values clamp to zero and then to the key's minimum.
fn toml_usize(value: &toml::Value) -> Option<usize> {
    match value {
        toml::Value::Integer(n) => Some((*n).max(0) as usize),
        toml::Value::String(s) => parse_usize(s),
        _ => None,
    }
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.trim().parse::<i64>().ok().map(|n| n.max(0) as usize)
}

fn default_data_dir(home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) => home.join(CONFIG_DIR),
        None => PathBuf::from(CONFIG_DIR),
    }
}

fn expand_tilde(raw: &str, home: Option<&Path>) -> PathBuf {
    match (raw, home) {
        ("~", Some(home)) => home.to_path_buf(),
        (s, Some(home)) if s.starts_with("~/") => home.join(&s[2..]),
        (s, _) => PathBuf::from(s),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
