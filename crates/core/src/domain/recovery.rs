use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::incident::{Incident, Severity};

/// A single remediation action within a recovery procedure.
///
/// Targets left as `None` are resolved against the incident's first affected
/// component when the action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartService {
        #[serde(default)]
        service: Option<String>,
    },
    ClearCache {
        #[serde(default)]
        cache: Option<String>,
    },
    ScaleResources {
        #[serde(default)]
        component: Option<String>,
        factor: f64,
    },
    RollbackDeployment {
        #[serde(default)]
        deployment: Option<String>,
    },
    Wait {
        seconds: u64,
    },
}

impl RecoveryAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RestartService { .. } => "restart_service",
            Self::ClearCache { .. } => "clear_cache",
            Self::ScaleResources { .. } => "scale_resources",
            Self::RollbackDeployment { .. } => "rollback_deployment",
            Self::Wait { .. } => "wait",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::RestartService { service } => {
                format!("Restart service {}", service.as_deref().unwrap_or("(affected)"))
            }
            Self::ClearCache { cache } => {
                format!("Clear cache {}", cache.as_deref().unwrap_or("(all)"))
            }
            Self::ScaleResources { component, factor } => format!(
                "Scale {} by {:.1}x",
                component.as_deref().unwrap_or("(affected)"),
                factor
            ),
            Self::RollbackDeployment { deployment } => format!(
                "Roll back deployment {}",
                deployment.as_deref().unwrap_or("(latest)")
            ),
            Self::Wait { seconds } => format!("Wait {}s", seconds),
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Declarative, reusable remediation recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryProcedure {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Substrings matched (case-insensitively) against the incident text.
    #[serde(default)]
    pub error_patterns: Vec<String>,
    #[serde(default)]
    pub component_types: Vec<String>,
    #[serde(default)]
    pub severity_levels: Vec<Severity>,
    pub steps: Vec<RecoveryAction>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub success_rate: f64,
    pub usage_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryProcedure {
    pub fn new(name: impl Into<String>, steps: Vec<RecoveryAction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            error_patterns: Vec::new(),
            component_types: Vec::new(),
            severity_levels: Vec::new(),
            steps,
            timeout_secs: 300,
            max_retries: 1,
            success_rate: 0.0,
            usage_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_patterns<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.error_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_components<S: Into<String>>(
        mut self,
        components: impl IntoIterator<Item = S>,
    ) -> Self {
        self.component_types = components.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severity_levels = severities.into_iter().collect();
        self
    }

    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Whether this procedure applies to the incident. An empty filter list
    /// never excludes.
    pub fn matches(&self, incident: &Incident) -> bool {
        let text = incident.search_text();
        let pattern_ok = self.error_patterns.is_empty()
            || self
                .error_patterns
                .iter()
                .any(|p| text.contains(&p.to_lowercase()));

        let component_ok = self.component_types.is_empty()
            || incident.affected_components.is_empty()
            || incident.affected_components.iter().any(|c| {
                self.component_types
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(c))
            });

        let severity_ok =
            self.severity_levels.is_empty() || self.severity_levels.contains(&incident.severity);

        pattern_ok && component_ok && severity_ok
    }

    /// Fold one outcome into the running success rate.
    pub fn record_outcome(&mut self, success: bool) {
        self.usage_count += 1;
        let n = self.usage_count as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (n - 1.0) + outcome) / n;
        self.updated_at = Utc::now();
    }
}
