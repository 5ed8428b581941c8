use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,

    pub scheduler: Option<SchedulerConfig>,
    /// Keyed by job name.
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_secs: Option<u64>,
    pub max_interval_secs: Option<u64>,
    pub lock_ttl_secs: Option<u64>,
    pub store_busy_timeout_ms: Option<u64>,
    /// "inline" or "detached"
    pub dispatch: Option<String>,
    pub history_retention: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    /// "simple" or "period_based"
    pub kind: Option<String>,
    /// "day", "week" or "month"
    pub granularity: Option<String>,
    pub max_lookback_periods: Option<u32>,
    pub endpoint: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
