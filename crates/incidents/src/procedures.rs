use std::sync::{Arc, RwLock};
use uuid::Uuid;

use flowpilot_core::{Incident, RecoveryAction, RecoveryProcedure, Severity};

/// The default procedures every registry starts with.
pub fn seed_procedures() -> Vec<RecoveryProcedure> {
    vec![
        RecoveryProcedure::new(
            "service_restart",
            vec![
                RecoveryAction::RestartService { service: None },
                RecoveryAction::Wait { seconds: 10 },
            ],
        )
        .with_description("Restart the affected service and give it time to come back")
        .with_patterns([
            "timeout",
            "connection refused",
            "unresponsive",
            "service unavailable",
            "crash",
            "step_failure",
        ])
        .with_components(["api", "worker", "service"])
        .with_severities([Severity::High, Severity::Critical])
        .with_success_rate(0.8)
        .with_timeout_secs(120),
        RecoveryProcedure::new(
            "cache_clear",
            vec![
                RecoveryAction::ClearCache { cache: None },
                RecoveryAction::Wait { seconds: 5 },
            ],
        )
        .with_description("Flush caches suspected of serving stale or oversized data")
        .with_patterns(["cache", "stale", "memory", "response_time"])
        .with_components(["cache", "api"])
        .with_severities([Severity::Medium, Severity::High, Severity::Critical])
        .with_success_rate(0.7)
        .with_timeout_secs(60),
        RecoveryProcedure::new(
            "resource_scaling",
            vec![
                RecoveryAction::ScaleResources {
                    component: None,
                    factor: 1.5,
                },
                RecoveryAction::Wait { seconds: 30 },
            ],
        )
        .with_description("Add capacity to the affected component")
        .with_patterns([
            "memory",
            "cpu",
            "resource",
            "capacity",
            "error_rate",
            "response_time",
            "failed_workflows",
        ])
        .with_components(["worker", "api", "database"])
        .with_severities([Severity::High, Severity::Critical])
        .with_success_rate(0.6)
        .with_timeout_secs(300),
    ]
}

/// Shared, cloneable set of recovery procedures.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procedures: Arc<RwLock<Vec<RecoveryProcedure>>>,
}

impl ProcedureRegistry {
    pub fn new(procedures: Vec<RecoveryProcedure>) -> Self {
        Self {
            procedures: Arc::new(RwLock::new(procedures)),
        }
    }

    pub fn with_seed() -> Self {
        Self::new(seed_procedures())
    }

    /// Add a procedure, replacing any existing one with the same name.
    pub fn register(&self, procedure: RecoveryProcedure) {
        let mut procedures = self
            .procedures
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        procedures.retain(|p| p.name != procedure.name);
        procedures.push(procedure);
    }

    pub fn list(&self) -> Vec<RecoveryProcedure> {
        self.procedures
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<RecoveryProcedure> {
        self.procedures
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Procedures applicable to the incident, best historical success rate first.
    pub fn candidates(&self, incident: &Incident) -> Vec<RecoveryProcedure> {
        let mut candidates: Vec<RecoveryProcedure> = self
            .procedures
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|p| p.matches(incident))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        candidates
    }

    /// Fold an application outcome into the procedure's success rate and
    /// return the new rate.
    pub fn record_outcome(&self, procedure_id: Uuid, success: bool) -> Option<f64> {
        let mut procedures = self
            .procedures
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let procedure = procedures.iter_mut().find(|p| p.id == procedure_id)?;
        procedure.record_outcome(success);
        Some(procedure.success_rate)
    }
}

impl std::fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("procedures", &self.list().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn procedure(name: &str, rate: f64) -> RecoveryProcedure {
        RecoveryProcedure::new(name, vec![RecoveryAction::Wait { seconds: 0 }])
            .with_patterns(["disk"])
            .with_success_rate(rate)
    }

    #[test]
    fn test_seed_set() {
        let registry = ProcedureRegistry::with_seed();
        let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["service_restart", "cache_clear", "resource_scaling"]);
    }

    #[test]
    fn test_candidates_sorted_by_success_rate() {
        let registry = ProcedureRegistry::new(vec![procedure("low", 0.3), procedure("high", 0.9)]);
        let incident = Incident::new("disk", "disk nearly full", Severity::High);

        let names: Vec<String> = registry
            .candidates(&incident)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["high", "low"]);
    }

    #[test]
    fn test_candidates_excludes_non_matching() {
        let registry = ProcedureRegistry::new(vec![procedure("disk", 0.5)]);
        let incident = Incident::new("api", "latency spike", Severity::High);
        assert!(registry.candidates(&incident).is_empty());
    }

    #[test]
    fn test_register_replaces_by_name() {
        let registry = ProcedureRegistry::new(vec![procedure("disk", 0.5)]);
        registry.register(procedure("disk", 0.1));
        let all = registry.list();
        assert_eq!(all.len(), 1);
        assert!((all[0].success_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_outcome_updates_shared_state() {
        let registry = ProcedureRegistry::new(vec![procedure("disk", 0.5)]);
        let clone = registry.clone();
        let id = registry.list()[0].id;

        assert_eq!(clone.record_outcome(id, false), Some(0.0));
        let stored = registry.get("disk").unwrap();
        assert_eq!(stored.usage_count, 1);
        assert_eq!(registry.record_outcome(Uuid::new_v4(), true), None);
    }

    #[test]
    fn test_seed_matches_critical_error_rate() {
        let registry = ProcedureRegistry::with_seed();
        let incident = Incident::new(
            "error_rate",
            "Metric error_rate is critical",
            Severity::Critical,
        );
        let names: Vec<String> = registry
            .candidates(&incident)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["resource_scaling"]);
    }
}
