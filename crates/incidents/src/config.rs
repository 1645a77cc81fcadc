use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use flowpilot_core::HealthMetric;

const DEFAULT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl MetricThresholds {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Health monitor settings: sampling interval and the fixed metric set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_metrics")]
    pub metrics: BTreeMap<String, MetricThresholds>,
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_metrics() -> BTreeMap<String, MetricThresholds> {
    BTreeMap::from([
        ("error_rate".to_string(), MetricThresholds::new(5.0, 10.0)),
        ("response_time".to_string(), MetricThresholds::new(1000.0, 3000.0)),
        ("failed_workflows".to_string(), MetricThresholds::new(1.0, 3.0)),
        ("stuck_workflows".to_string(), MetricThresholds::new(1.0, 1.0)),
    ])
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            metrics: default_metrics(),
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an empty metric set.
    pub fn empty() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, warning: f64, critical: f64) -> Self {
        self.metrics
            .insert(name.into(), MetricThresholds::new(warning, critical));
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn build_metrics(&self) -> BTreeMap<String, HealthMetric> {
        self.metrics
            .iter()
            .map(|(name, t)| (name.clone(), HealthMetric::new(name, t.warning, t.critical)))
            .collect()
    }
}
