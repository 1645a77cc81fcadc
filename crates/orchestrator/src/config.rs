use serde::{Deserialize, Serialize};
use std::time::Duration;

use flowpilot_core::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};

/// Tunables for the workflow engine and step executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Length of one backoff unit.
    pub backoff_unit_ms: u64,
    /// Upper bound of the backoff multiplier.
    pub backoff_cap_units: u64,
    pub default_step_timeout_secs: u64,
    pub default_max_retries: u32,
    pub agent_poll_interval_secs: u64,
    pub parallel_group_limit: usize,
    /// How long terminal workflows stay in the store.
    pub retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff_unit_ms: 1000,
            backoff_cap_units: 60,
            default_step_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            agent_poll_interval_secs: 10,
            parallel_group_limit: 4,
            retention_secs: 3600,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit_ms = unit.as_millis() as u64;
        self
    }

    pub fn with_backoff_cap(mut self, units: u64) -> Self {
        self.backoff_cap_units = units;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_agent_poll_interval(mut self, interval: Duration) -> Self {
        self.agent_poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_parallel_group_limit(mut self, limit: usize) -> Self {
        self.parallel_group_limit = limit.max(1);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    /// Delay before the retry numbered `retry_count` (1-based):
    /// `min(2^retry_count, cap)` backoff units.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let units = 1u64
            .checked_shl(retry_count)
            .unwrap_or(u64::MAX)
            .min(self.backoff_cap_units);
        self.backoff_unit().saturating_mul(units.min(u32::MAX as u64) as u32)
    }

    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_secs(self.agent_poll_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
