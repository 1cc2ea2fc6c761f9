//! Configuration file handling

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct HarnessConfig {
    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Runner settings
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Upper bound for a single CLI invocation, in seconds
    #[serde(default = "default_process")]
    pub process_secs: u64,

    /// Upper bound for each console `expect` operation, in seconds
    #[serde(default = "default_expect")]
    pub expect_secs: u64,

    /// How often `expect` re-checks the console output buffer
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Time given to output readers after a forced kill
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            process_secs: default_process(),
            expect_secs: default_expect(),
            poll_interval_ms: default_poll_interval(),
            drain_grace_ms: default_drain_grace(),
        }
    }
}

impl Timeouts {
    pub fn process(&self) -> Duration {
        Duration::from_secs(self.process_secs)
    }

    pub fn expect(&self) -> Duration {
        Duration::from_secs(self.expect_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        // a zero interval would spin
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

fn default_process() -> u64 {
    300
}
fn default_expect() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    50
}
fn default_drain_grace() -> u64 {
    500
}

/// Runner configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Number of scenario groups allowed to run at the same time
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { jobs: default_jobs() }
    }
}

fn default_jobs() -> usize {
    1
}

impl HarnessConfig {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would fail every scenario
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("timeouts.process_secs", self.timeouts.process_secs),
            ("timeouts.expect_secs", self.timeouts.expect_secs),
        ] {
            if value == 0 {
                return Err(super::Error::Config(format!("{key} must be greater than 0")));
            }
        }
        Ok(())
    }
}
