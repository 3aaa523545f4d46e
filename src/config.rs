use crate::logging::LogConfig;
use crate::{anyhow_loc, function_name};
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::time::Duration;

/// Scheduler settings, read from a JSON file. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedConfig {
    /// SQLite database holding catalog, builds, queues and test sets.
    #[serde(default = "default_db_path")]
    pub db_path: Utf8PathBuf,

    /// Root that relative build artifact locations are resolved against.
    #[serde(default)]
    pub build_root: Option<Utf8PathBuf>,

    /// Re-check that a chosen build's artifacts still exist before dispatching it.
    #[serde(default)]
    pub verify_build_artifacts: bool,

    /// Wall clock budget for one testbox poll.
    #[serde(default = "default_poll_time_budget_ms")]
    pub poll_time_budget_ms: u64,

    /// How long a gang may gather before the sweeper gives up on it.
    #[serde(default = "default_gang_gathering_timeout_secs")]
    pub gang_gathering_timeout_secs: i64,

    /// Number of builds fetched per round trip by a build cursor.
    #[serde(default = "default_build_page_size")]
    pub build_page_size: usize,

    #[serde(default)]
    pub logging: LogConfig,
}

fn default_db_path() -> Utf8PathBuf {
    Utf8PathBuf::from("testfarm.db")
}

fn default_poll_time_budget_ms() -> u64 {
    10_000
}

fn default_gang_gathering_timeout_secs() -> i64 {
    30 * 60
}

fn default_build_page_size() -> usize {
    16
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            build_root: None,
            verify_build_artifacts: false,
            poll_time_budget_ms: default_poll_time_budget_ms(),
            gang_gathering_timeout_secs: default_gang_gathering_timeout_secs(),
            build_page_size: default_build_page_size(),
            logging: LogConfig::default(),
        }
    }
}

impl SchedConfig {
    pub fn load(path: &Utf8Path) -> anyhow::Result<SchedConfig> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config [{}]", path))?;
        Self::from_json(&text).with_context(|| format!("Invalid config [{}]", path))
    }

    pub fn from_json(text: &str) -> anyhow::Result<SchedConfig> {
        let config: SchedConfig = serde_json::from_str(text)?;
        if config.build_page_size == 0 {
            return Err(anyhow_loc!("build_page_size must be at least 1"));
        }
        Ok(config)
    }

    pub fn poll_time_budget(&self) -> Duration {
        Duration::from_millis(self.poll_time_budget_ms)
    }
}
