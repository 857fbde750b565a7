use flowcore::FlowError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the execution event broadcast channel
    pub event_buffer_size: usize,
    /// Upper bound on items a loop node may fan out to
    pub max_loop_iterations: usize,
    /// Upper bound on steps (node dispatches and join entries) within a single execution
    pub max_steps: usize,
    pub supervisor: SupervisorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            max_loop_iterations: 1000,
            max_steps: 10_000,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, FlowError> {
        toml::from_str(toml_str).map_err(|e| FlowError::Config(e.to_string()))
    }
}

/// Stuck-execution reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    /// Seconds between background sweeps
    pub interval_secs: u64,
    /// Age after which a pending/running execution is cancelled
    pub stuck_threshold_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            stuck_threshold_secs: 600,
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}
