//! Periodic health sampling.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use events::{Event, EventSink};
use flowpilot_core::{health_score, HealthMetric, MetricStatus, Severity};

use crate::config::MonitorConfig;
use crate::handler::IncidentHandler;
use crate::metrics::MetricSource;

/// Result of one monitoring cycle.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub score: u32,
    pub metrics: Vec<HealthMetric>,
    pub raised: Vec<Uuid>,
}

impl HealthSnapshot {
    pub fn names_with(&self, status: MetricStatus) -> Vec<String> {
        self.metrics
            .iter()
            .filter(|m| m.status == status)
            .map(|m| m.name.clone())
            .collect()
    }
}

pub struct HealthMonitor {
    config: MonitorConfig,
    metrics: RwLock<BTreeMap<String, HealthMetric>>,
    source: Arc<dyn MetricSource>,
    incidents: Arc<IncidentHandler>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl HealthMonitor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn MetricSource>,
        incidents: Arc<IncidentHandler>,
    ) -> Self {
        let metrics = config.build_metrics();
        Self {
            config,
            metrics: RwLock::new(metrics),
            source,
            incidents,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current metric set without sampling.
    pub fn metrics(&self) -> Vec<HealthMetric> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn health_score(&self) -> u32 {
        health_score(
            self.metrics
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .values(),
        )
    }

    /// Sample every metric once, raise incidents for metrics that just turned
    /// critical and publish a health report.
    pub async fn run_cycle(&self) -> HealthSnapshot {
        let names: Vec<String> = self.config.metrics.keys().cloned().collect();

        let mut samples = Vec::with_capacity(names.len());
        for name in names {
            match self.source.sample(&name).await {
                Ok(Some(value)) => samples.push((name, value)),
                Ok(None) => debug!(metric = %name, "Metric not provided by source"),
                Err(e) => warn!(metric = %name, error = %e, "Failed to sample metric"),
            }
        }

        let newly_critical: Vec<HealthMetric> = {
            let mut metrics = self
                .metrics
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            samples
                .into_iter()
                .filter_map(|(name, value)| {
                    let metric = metrics.get_mut(&name)?;
                    let previous = metric.update(value);
                    (metric.status == MetricStatus::Critical && previous != MetricStatus::Critical)
                        .then(|| metric.clone())
                })
                .collect()
        };

        let mut raised = Vec::new();
        for metric in newly_critical {
            if self.incidents.has_open_incident(&metric.name) {
                debug!(metric = %metric.name, "Open incident already tracks metric");
                continue;
            }
            let message = format!(
                "Metric {} is critical: {} (threshold {})",
                metric.name, metric.current_value, metric.threshold_critical
            );
            let context: Map<String, Value> = json!({
                "metric": metric.name,
                "value": metric.current_value,
                "threshold_warning": metric.threshold_warning,
                "threshold_critical": metric.threshold_critical,
            })
            .as_object()
            .cloned()
            .unwrap_or_default();

            raised.push(self.incidents.detect_incident(
                &metric.name,
                &message,
                context,
                Severity::Critical,
            ));
        }

        let metrics = self.metrics();
        let snapshot = HealthSnapshot {
            score: health_score(&metrics),
            metrics,
            raised,
        };

        if let Some(sink) = &self.event_sink {
            sink.emit(Event::HealthReport {
                score: snapshot.score,
                critical: snapshot.names_with(MetricStatus::Critical),
                warning: snapshot.names_with(MetricStatus::Warning),
            });
        }

        debug!(score = snapshot.score, raised = snapshot.raised.len(), "Health cycle complete");
        snapshot
    }

    /// Run cycles on the configured interval until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.config.interval_secs, "Health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
