use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetric {
    pub name: String,
    pub current_value: f64,
    pub threshold_warning: f64,
    pub threshold_critical: f64,
    pub status: MetricStatus,
    pub measured_at: DateTime<Utc>,
}

impl HealthMetric {
    pub fn new(name: impl Into<String>, threshold_warning: f64, threshold_critical: f64) -> Self {
        Self {
            name: name.into(),
            current_value: 0.0,
            threshold_warning,
            threshold_critical,
            status: MetricStatus::Normal,
            measured_at: Utc::now(),
        }
    }

    pub fn evaluate(&self, value: f64) -> MetricStatus {
        if value >= self.threshold_critical {
            MetricStatus::Critical
        } else if value >= self.threshold_warning {
            MetricStatus::Warning
        } else {
            MetricStatus::Normal
        }
    }

    /// Record a new sample and return the status it had before.
    pub fn update(&mut self, value: f64) -> MetricStatus {
        let previous = self.status;
        self.current_value = value;
        self.status = self.evaluate(value);
        self.measured_at = Utc::now();
        previous
    }
}

/// `max(0, 100 - 30 * critical - 10 * warning)`
pub fn health_score<'a>(metrics: impl IntoIterator<Item = &'a HealthMetric>) -> u32 {
    let (critical, warning) = metrics
        .into_iter()
        .fold((0i64, 0i64), |(c, w), m| match m.status {
            MetricStatus::Critical => (c + 1, w),
            MetricStatus::Warning => (c, w + 1),
            MetricStatus::Normal => (c, w),
        });
    (100 - 30 * critical - 10 * warning).max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_thresholds() {
        let metric = HealthMetric::new("error_rate", 5.0, 10.0);
        assert_eq!(metric.evaluate(1.0), MetricStatus::Normal);
        assert_eq!(metric.evaluate(5.0), MetricStatus::Warning);
        assert_eq!(metric.evaluate(12.0), MetricStatus::Critical);
    }

    #[test]
    fn test_update_returns_previous_status() {
        let mut metric = HealthMetric::new("response_time", 1000.0, 3000.0);
        assert_eq!(metric.update(3500.0), MetricStatus::Normal);
        assert_eq!(metric.status, MetricStatus::Critical);
        assert_eq!(metric.update(10.0), MetricStatus::Critical);
        assert_eq!(metric.status, MetricStatus::Normal);
    }

    #[test]
    fn test_health_score() {
        let mut critical = HealthMetric::new("a", 1.0, 2.0);
        critical.update(3.0);
        let mut warning = HealthMetric::new("b", 1.0, 2.0);
        warning.update(1.5);
        let normal = HealthMetric::new("c", 1.0, 2.0);

        assert_eq!(health_score([&normal]), 100);
        assert_eq!(health_score([&critical, &warning, &normal]), 60);
        assert_eq!(
            health_score([&critical, &critical, &critical, &critical]),
            0
        );
    }
}
