use crate::utils::config_io::load_cfg;
use crate::utils::logger::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for spin loops.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpinConfig {
    /// Upper bound on how long a blocked `Node::spin` can miss a cancellation
    /// that arrives without an explicit wake (OS signal).
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Sleep between executor rounds.
    #[serde(default = "default_executor_idle_us")]
    pub executor_idle_us: u64,
    /// Pin dedicated node spin threads to this core.
    #[serde(default)]
    pub core_id: Option<usize>,
}

fn default_poll_interval_us() -> u64 {
    50
}

fn default_executor_idle_us() -> u64 {
    1
}

impl SpinConfig {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }

    #[inline]
    pub fn executor_idle(&self) -> Duration {
        Duration::from_micros(self.executor_idle_us)
    }
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: default_poll_interval_us(),
            executor_idle_us: default_executor_idle_us(),
            core_id: None,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RclConfig {
    #[serde(default)]
    pub domain_id: u16,
    #[serde(default)]
    pub spin: SpinConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
}

impl RclConfig {
    /// Load from a TOML/JSON/YAML file; `RCLITE__SPIN__POLL_INTERVAL_US`-style
    /// environment variables override file values.
    pub fn load(path: impl AsRef<str>) -> anyhow::Result<Self> {
        load_cfg(path)
    }
}
