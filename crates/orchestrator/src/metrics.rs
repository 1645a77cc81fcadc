//! Orchestration signals exposed to the health monitor.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use incidents::MetricSource;

const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Samples {
    steps: VecDeque<(Instant, bool, Duration)>,
    workflow_failures: VecDeque<(Instant, bool)>,
}

/// Sliding-window counters for step outcomes and failed workflows.
///
/// Serves `error_rate` (% of failed step executions), `response_time`
/// (mean step duration in ms), `failed_workflows` and `stuck_workflows`.
#[derive(Debug)]
pub struct EngineMetrics {
    window: Duration,
    samples: Mutex<Samples>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl EngineMetrics {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(Samples::default()),
        }
    }

    pub fn record_step(&self, success: bool, duration: Duration) {
        let mut samples = self.lock();
        samples.steps.push_back((Instant::now(), success, duration));
    }

    pub fn record_workflow_failed(&self, stuck: bool) {
        let mut samples = self.lock();
        samples.workflow_failures.push_back((Instant::now(), stuck));
    }

    pub fn error_rate(&self) -> Option<f64> {
        let samples = self.evicted();
        if samples.steps.is_empty() {
            return None;
        }
        let failed = samples.steps.iter().filter(|(_, ok, _)| !ok).count();
        Some(failed as f64 * 100.0 / samples.steps.len() as f64)
    }

    pub fn response_time_ms(&self) -> Option<f64> {
        let samples = self.evicted();
        if samples.steps.is_empty() {
            return None;
        }
        let total: f64 = samples
            .steps
            .iter()
            .map(|(_, _, d)| d.as_secs_f64() * 1000.0)
            .sum();
        Some(total / samples.steps.len() as f64)
    }

    pub fn failed_workflows(&self) -> usize {
        self.evicted().workflow_failures.len()
    }

    pub fn stuck_workflows(&self) -> usize {
        self.evicted()
            .workflow_failures
            .iter()
            .filter(|(_, stuck)| *stuck)
            .count()
    }

    fn evicted(&self) -> std::sync::MutexGuard<'_, Samples> {
        let mut samples = self.lock();
        let window = self.window;
        while samples
            .steps
            .front()
            .is_some_and(|(at, _, _)| at.elapsed() > window)
        {
            samples.steps.pop_front();
        }
        while samples
            .workflow_failures
            .front()
            .is_some_and(|(at, _)| at.elapsed() > window)
        {
            samples.workflow_failures.pop_front();
        }
        samples
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Samples> {
        self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MetricSource for EngineMetrics {
    async fn sample(&self, metric: &str) -> incidents::Result<Option<f64>> {
        Ok(match metric {
            "error_rate" => Some(self.error_rate().unwrap_or(0.0)),
            "response_time" => self.response_time_ms(),
            "failed_workflows" => Some(self.failed_workflows() as f64),
            "stuck_workflows" => Some(self.stuck_workflows() as f64),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_signals() {
        let metrics = EngineMetrics::default();
        assert_eq!(metrics.sample("response_time").await.unwrap(), None);
        assert_eq!(metrics.sample("error_rate").await.unwrap(), Some(0.0));

        metrics.record_step(true, Duration::from_millis(100));
        metrics.record_step(false, Duration::from_millis(300));
        metrics.record_workflow_failed(true);
        metrics.record_workflow_failed(false);

        assert_eq!(metrics.sample("error_rate").await.unwrap(), Some(50.0));
        let response_time = metrics.sample("response_time").await.unwrap().unwrap();
        assert!((response_time - 200.0).abs() < 1e-6);
        assert_eq!(metrics.sample("failed_workflows").await.unwrap(), Some(2.0));
        assert_eq!(metrics.sample("stuck_workflows").await.unwrap(), Some(1.0));
        assert_eq!(metrics.sample("cpu").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_eviction() {
        let metrics = EngineMetrics::new(Duration::from_secs(60));
        metrics.record_step(false, Duration::from_millis(10));
        tokio::time::advance(Duration::from_secs(61)).await;
        metrics.record_step(true, Duration::from_millis(10));

        assert_eq!(metrics.error_rate(), Some(0.0));
    }
}
