//! Runtime configuration.
//!
//! Configuration is a single JSON file; every field has a default so an
//! empty file (or no file at all) yields a working development setup.

use crate::errors::{RelaydeskError, RelaydeskResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8600
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path", rename = "dbPath")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("relaydesk.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default = "default_sentiment_threshold", rename = "sentimentThreshold")]
    pub sentiment_threshold: f32,
    #[serde(default = "default_pipeline_timeout", rename = "pipelineTimeoutSecs")]
    pub pipeline_timeout_secs: u64,
    #[serde(default = "default_history_limit", rename = "historyLimit")]
    pub history_limit: usize,
}

fn default_sentiment_threshold() -> f32 {
    0.35
}

fn default_pipeline_timeout() -> u64 {
    60
}

fn default_history_limit() -> usize {
    30
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            sentiment_threshold: default_sentiment_threshold(),
            pipeline_timeout_secs: default_pipeline_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSection {
    #[serde(default = "default_tolerance_secs", rename = "toleranceSecs")]
    pub tolerance_secs: i64,
}

fn default_tolerance_secs() -> i64 {
    30
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_sink_capacity", rename = "sinkCapacity")]
    pub sink_capacity: usize,
    #[serde(default = "default_snapshot_limit", rename = "snapshotLimit")]
    pub snapshot_limit: usize,
}

fn default_sink_capacity() -> usize {
    64
}

fn default_snapshot_limit() -> usize {
    100
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            sink_capacity: default_sink_capacity(),
            snapshot_limit: default_snapshot_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_reuse_window_hours", rename = "reuseWindowHours")]
    pub reuse_window_hours: i64,
    #[serde(default = "default_idle_archive_hours", rename = "idleArchiveHours")]
    pub idle_archive_hours: i64,
    #[serde(default = "default_sweep_interval", rename = "sweepIntervalSecs")]
    pub sweep_interval_secs: u64,
}

fn default_reuse_window_hours() -> i64 {
    24
}

fn default_idle_archive_hours() -> i64 {
    72
}

fn default_sweep_interval() -> u64 {
    600
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            reuse_window_hours: default_reuse_window_hours(),
            idle_archive_hours: default_idle_archive_hours(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineSection {
    /// Endpoint the reply pipeline POSTs to. Empty disables the bot and
    /// every session behaves as human-owned from the first takeover.
    #[serde(default, rename = "replyUrl")]
    pub reply_url: String,
    /// Optional sentiment endpoint. Empty disables sentiment escalation.
    #[serde(default, rename = "sentimentUrl")]
    pub sentiment_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl Config {
    pub fn validate(&self) -> RelaydeskResult<()> {
        if !(0.0..=1.0).contains(&self.routing.sentiment_threshold) {
            return Err(RelaydeskError::Config(format!(
                "routing.sentimentThreshold must be within 0..=1, got {}",
                self.routing.sentiment_threshold
            )));
        }
        if self.routing.pipeline_timeout_secs == 0 {
            return Err(RelaydeskError::Config(
                "routing.pipelineTimeoutSecs must be positive".to_string(),
            ));
        }
        if self.routing.history_limit == 0 {
            return Err(RelaydeskError::Config(
                "routing.historyLimit must be positive".to_string(),
            ));
        }
        if self.reconcile.tolerance_secs < 0 {
            return Err(RelaydeskError::Config(
                "reconcile.toleranceSecs must not be negative".to_string(),
            ));
        }
        if self.hub.sink_capacity == 0 {
            return Err(RelaydeskError::Config(
                "hub.sinkCapacity must be positive".to_string(),
            ));
        }
        if self.sessions.reuse_window_hours < 0 || self.sessions.idle_archive_hours < 0 {
            return Err(RelaydeskError::Config(
                "session windows must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(config_path: Option<&Path>) -> anyhow::Result<Config> {
    let default_path = PathBuf::from("relaydesk.json");
    let path = config_path.unwrap_or(default_path.as_path());

    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;
        return Ok(config);
    }

    Ok(Config::default())
}
