//! Dispatcher configuration management

use crate::batch::ThrottlePolicy;
use crate::error::{Error, Result};
use crate::progress::MAX_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main dispatcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// External agent configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Batch dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchSettings,

    /// Report export configuration
    #[serde(default)]
    pub report: ReportConfig,
}

impl DispatchConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.log_capacity == 0 || self.dispatch.log_capacity > MAX_CAPACITY {
            return Err(Error::Config(format!(
                "dispatch.log_capacity must be between 1 and {}",
                MAX_CAPACITY
            )));
        }
        if self.dispatch.dry_run_limit == 0 {
            return Err(Error::Config("dispatch.dry_run_limit must be at least 1".to_string()));
        }
        if self.report.delimiter == '"' || self.report.delimiter == '\n' {
            return Err(Error::Config(format!(
                "report.delimiter cannot be {:?}",
                self.report.delimiter
            )));
        }
        self.dispatch
            .default_throttle
            .validate()
            .map_err(|e| Error::Config(format!("dispatch.default_throttle: {}", e)))?;
        Ok(())
    }
}

/// External agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to the agent binary (None = search PATH)
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Extra arguments passed to the agent
    #[serde(default)]
    pub args: Vec<String>,

    /// How long to wait for a reply to a presence/session query, in milliseconds
    pub reply_timeout_ms: u64,
}

impl AgentConfig {
    /// Reply timeout as a `Duration`
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            reply_timeout_ms: 5_000,
        }
    }
}

/// Batch dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Number of recipients kept when a request is a dry run
    pub dry_run_limit: usize,

    /// Capacity of the rolling event log
    pub log_capacity: usize,

    /// Seconds without any agent event before an active batch is declared
    /// stalled (0 = never)
    pub stall_timeout_secs: u64,

    /// Throttle used when a request does not carry its own
    pub default_throttle: ThrottlePolicy,
}

impl DispatchSettings {
    /// Stall timeout, or `None` when disabled
    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_secs > 0).then(|| Duration::from_secs(self.stall_timeout_secs))
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            dry_run_limit: 3,
            log_capacity: 50,
            stall_timeout_secs: 15 * 60,
            default_throttle: ThrottlePolicy::default(),
        }
    }
}

/// Report export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory reports are written to
    pub dir: PathBuf,

    /// Field delimiter
    pub delimiter: char,
}

impl Default for ReportConfig {
    fn default() -> Self {
        let dir = dirs_next::document_dir()
            .or_else(dirs_next::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("massdispatch")
            .join("reports");

        Self { dir, delimiter: ',' }
    }
}
