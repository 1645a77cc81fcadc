use async_trait::async_trait;

use crate::error::Result;

/// Source of health signals sampled by the monitor.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Current value of the named metric, or `None` when this source does not
    /// provide it.
    async fn sample(&self, metric: &str) -> Result<Option<f64>>;
}
