//! Runner configuration and the environment handed to worker processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of the worker, read by the worker runtime.
pub const WORKER_ID_ENV: &str = "WDIO_WORKER_ID";
/// Per-worker log file, set when an output directory is configured.
pub const LOG_PATH_ENV: &str = "WDIO_LOG_PATH";
/// Runtime flags of the worker runtime; the orchestrator's own flags are propagated.
pub const RUNTIME_OPTIONS_ENV: &str = "NODE_OPTIONS";
const RUNTIME_ENV: &str = "NODE_ENV";

const DEFAULT_RUNTIME_OPTIONS: &str = "--enable-source-maps";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings shared by every worker of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Directory for per-worker log files.
    pub output_dir: Option<PathBuf>,
    /// Environment overrides for worker processes.
    pub runner_env: BTreeMap<String, String>,
    /// Buffer worker stdout and flush it as a block instead of streaming it.
    pub group_logs_by_test_spec: bool,
    /// Upper bound on waiting for `ready` (and `sessionStarted` when required).
    /// `None` waits forever.
    #[serde(with = "duration_ms")]
    pub ready_timeout: Option<Duration>,
    /// How long to keep reading worker messages after the process exited.
    #[serde(with = "duration_ms")]
    pub exit_drain_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            runner_env: BTreeMap::new(),
            group_logs_by_test_spec: false,
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
            exit_drain_timeout: Some(DEFAULT_EXIT_DRAIN_TIMEOUT),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_runner_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.runner_env.insert(key.into(), value.into());
        self
    }

    pub fn with_grouped_logs(mut self, grouped: bool) -> Self {
        self.group_logs_by_test_spec = grouped;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_exit_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exit_drain_timeout = timeout;
        self
    }

    pub fn log_path(&self, cid: &str) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("wdio-{cid}.log")))
    }
}

/// Build the environment of a worker process.
///
/// Layers, later ones winning: orchestrator defaults, the orchestrator's own
/// environment, user `runner_env` overrides, then the enforced identity
/// values. Finally the orchestrator's runtime flags are prepended to the
/// user-supplied (or default) worker runtime flags.
pub fn worker_env<I>(parent_env: I, config: &RunnerConfig, cid: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let parent: BTreeMap<String, String> = parent_env.into_iter().collect();

    let mut env = BTreeMap::new();
    env.insert(
        RUNTIME_OPTIONS_ENV.to_string(),
        DEFAULT_RUNTIME_OPTIONS.to_string(),
    );
    env.extend(parent.clone());
    env.extend(config.runner_env.clone());

    env.insert(WORKER_ID_ENV.to_string(), cid.to_string());
    let runtime_env = parent
        .get(RUNTIME_ENV)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| "test".to_string());
    env.insert(RUNTIME_ENV.to_string(), runtime_env);
    if let Some(path) = config.log_path(cid) {
        env.insert(LOG_PATH_ENV.to_string(), path.display().to_string());
    }

    let worker_options = config
        .runner_env
        .get(RUNTIME_OPTIONS_ENV)
        .map(String::as_str)
        .unwrap_or(DEFAULT_RUNTIME_OPTIONS);
    let options = [parent.get(RUNTIME_OPTIONS_ENV).map(String::as_str), Some(worker_options)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    env.insert(RUNTIME_OPTIONS_ENV.to_string(), options);

    env
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
