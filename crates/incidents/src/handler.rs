//! Incident intake and automated recovery.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use events::{Event, EventSink};
use flowpilot_core::{Incident, IncidentStatus, RecoveryAction, RecoveryProcedure, Severity};

use crate::actions::RecoveryActions;
use crate::classifier::{classify, infer_root_cause};
use crate::error::{IncidentError, Result};
use crate::metrics::MetricSource;
use crate::procedures::ProcedureRegistry;
use crate::state_machine::IncidentStateMachine;

/// Owns every incident record and drives them from `detected` to
/// `resolved`, or flags them for manual intervention.
pub struct IncidentHandler {
    incidents: RwLock<HashMap<Uuid, Incident>>,
    procedures: ProcedureRegistry,
    actions: Arc<dyn RecoveryActions>,
    verifier: Option<Arc<dyn MetricSource>>,
    event_sink: Option<Arc<dyn EventSink>>,
    /// Present only while a worker is draining it.
    queue: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
}

impl IncidentHandler {
    pub fn new(procedures: ProcedureRegistry, actions: Arc<dyn RecoveryActions>) -> Self {
        Self {
            incidents: RwLock::new(HashMap::new()),
            procedures,
            actions,
            verifier: None,
            event_sink: None,
            queue: Mutex::new(None),
        }
    }

    /// Re-sample the triggering metric before declaring a procedure successful.
    pub fn with_verifier(mut self, verifier: Arc<dyn MetricSource>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn procedures(&self) -> &ProcedureRegistry {
        &self.procedures
    }

    /// Record a new incident and, when a worker runs, queue it for
    /// processing. Never blocks.
    ///
    /// `context["component"]` (string) or `context["components"]` (array)
    /// name the affected components.
    pub fn detect_incident(
        &self,
        incident_type: &str,
        message: &str,
        context: Map<String, Value>,
        severity: Severity,
    ) -> Uuid {
        let components = components_from_context(&context);
        let mut incident = Incident::new(incident_type, message, severity)
            .with_context(context)
            .with_components(components);
        incident.error_classification = classify(message);

        let id = incident.id;
        info!(
            incident_id = %id,
            incident_type = %incident_type,
            severity = %severity,
            classification = %incident.error_classification,
            "Incident detected"
        );

        self.write().insert(id, incident);

        self.emit(Event::IncidentDetected {
            incident_id: id,
            incident_type: incident_type.to_string(),
            severity: severity.as_str().to_string(),
            message: message.to_string(),
        });

        self.enqueue(id);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Incident> {
        self.read().get(&id).cloned()
    }

    /// All incidents, oldest first.
    pub fn list(&self) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self.read().values().cloned().collect();
        incidents.sort_by_key(|i| i.detected_at);
        incidents
    }

    pub fn list_open(&self) -> Vec<Incident> {
        self.list().into_iter().filter(|i| i.is_open()).collect()
    }

    pub fn has_open_incident(&self, incident_type: &str) -> bool {
        self.read()
            .values()
            .any(|i| i.is_open() && i.incident_type == incident_type)
    }

    /// Operator override: records the note and marks the incident resolved.
    /// Returns false for unknown or already closed incidents.
    pub fn resolve_manually(&self, id: Uuid, notes: &str) -> bool {
        let updated = {
            let mut incidents = self.write();
            let Some(incident) = incidents.get_mut(&id) else {
                return false;
            };
            if incident.status == IncidentStatus::Closed {
                return false;
            }
            incident.record_step("manual_resolution", None, true, Some(notes.to_string()));
            if incident.status != IncidentStatus::Resolved {
                incident.status = IncidentStatus::Resolved;
                incident.resolved_at = Some(Utc::now());
            }
            incident.status
        };

        info!(incident_id = %id, "Incident resolved manually");
        self.emit(Event::IncidentStatusChanged {
            incident_id: id,
            status: updated.as_str().to_string(),
            message: Some(notes.to_string()),
        });
        true
    }

    pub fn close(&self, id: Uuid) -> Result<Incident> {
        self.transition(id, IncidentStatus::Closed, None)
    }

    /// Run the automated recovery pipeline for one incident.
    ///
    /// Only incidents still in `detected` are processed; anything else is
    /// returned unchanged.
    pub async fn process(&self, id: Uuid) -> Result<Incident> {
        let incident = self.get(id).ok_or(IncidentError::NotFound(id))?;
        if incident.status != IncidentStatus::Detected {
            return Ok(incident);
        }

        let root_cause = infer_root_cause(&incident.message, incident.error_classification);
        self.update(id, |i| i.root_cause = Some(root_cause.clone()))?;
        let incident = self.transition(id, IncidentStatus::Investigating, Some(root_cause))?;

        let candidates = self.procedures.candidates(&incident);
        if candidates.is_empty() {
            warn!(incident_id = %id, "No recovery procedure matches; manual intervention required");
            return self.flag_manual(id, "No matching recovery procedure");
        }

        self.transition(
            id,
            IncidentStatus::Resolving,
            Some(format!("{} candidate procedure(s)", candidates.len())),
        )?;

        for (index, procedure) in candidates.iter().enumerate() {
            if !self.get(id).is_some_and(|i| i.is_open()) {
                debug!(incident_id = %id, "Incident closed externally; stopping recovery");
                return self.get(id).ok_or(IncidentError::NotFound(id));
            }

            let success = self.apply_procedure(&incident, procedure).await;
            if !self.get(id).is_some_and(|i| i.is_open()) {
                debug!(
                    incident_id = %id,
                    procedure = %procedure.name,
                    "Incident resolved externally during recovery; outcome discarded"
                );
                return self.get(id).ok_or(IncidentError::NotFound(id));
            }
            self.procedures.record_outcome(procedure.id, success);

            info!(
                incident_id = %id,
                procedure = %procedure.name,
                success,
                "Recovery procedure applied"
            );

            if success {
                let attempted = (index + 1) as f64;
                return self.mark_recovered(id, 1.0 / attempted, &procedure.name);
            }
        }

        warn!(incident_id = %id, "All recovery procedures failed; manual intervention required");
        self.flag_manual(id, "All recovery procedures failed")
    }

    /// Drain the detection queue until shutdown. Incidents still `detected`
    /// when the worker starts are queued first. Only one worker may run.
    pub fn spawn_worker(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let mut queue = self.queue_guard();
        if queue.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let backlog: Vec<Uuid> = self
            .list()
            .into_iter()
            .filter(|i| i.status == IncidentStatus::Detected)
            .map(|i| i.id)
            .collect();
        if !backlog.is_empty() {
            debug!(count = backlog.len(), "Queueing incident backlog");
        }
        for id in backlog {
            let _ = tx.send(id);
        }
        *queue = Some(tx);
        drop(queue);

        let handler = Arc::clone(self);
        Some(tokio::spawn(async move {
            handler.run_worker(rx, shutdown).await;
        }))
    }

    async fn run_worker(&self, mut rx: mpsc::UnboundedReceiver<Uuid>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Incident worker shutting down");
                        break;
                    }
                }
                next = rx.recv() => {
                    let Some(id) = next else { break };
                    if let Err(e) = self.process(id).await {
                        warn!(incident_id = %id, error = %e, "Incident processing failed");
                    }
                }
            }
        }
    }

    /// Runs a procedure up to `1 + max_retries` times, each attempt bounded
    /// by the procedure timeout and confirmed by verification.
    async fn apply_procedure(&self, incident: &Incident, procedure: &RecoveryProcedure) -> bool {
        let attempts = 1 + procedure.max_retries;
        let timeout = Duration::from_secs(procedure.timeout_secs);

        for attempt in 1..=attempts {
            debug!(
                incident_id = %incident.id,
                procedure = %procedure.name,
                attempt,
                "Attempting recovery procedure"
            );

            match tokio::time::timeout(timeout, self.run_steps(incident, procedure)).await {
                Ok(Ok(())) => {
                    if self.verify(incident, procedure).await {
                        return true;
                    }
                }
                Ok(Err(e)) => {
                    self.record(incident.id, "procedure_failed", procedure, false, e.to_string());
                }
                Err(_) => {
                    let e = IncidentError::ProcedureTimeout {
                        procedure: procedure.name.clone(),
                        timeout_secs: procedure.timeout_secs,
                    };
                    self.record(incident.id, "procedure_timeout", procedure, false, e.to_string());
                }
            }
        }
        false
    }

    async fn run_steps(&self, incident: &Incident, procedure: &RecoveryProcedure) -> Result<()> {
        let fallback = incident
            .affected_components
            .first()
            .cloned()
            .unwrap_or_else(|| incident.incident_type.clone());

        for action in &procedure.steps {
            let outcome = match action {
                RecoveryAction::RestartService { service } => {
                    self.actions
                        .restart_service(service.as_deref().unwrap_or(&fallback))
                        .await
                }
                RecoveryAction::ClearCache { cache } => {
                    self.actions
                        .clear_cache(cache.as_deref().unwrap_or(&fallback))
                        .await
                }
                RecoveryAction::ScaleResources { component, factor } => {
                    self.actions
                        .scale_resources(component.as_deref().unwrap_or(&fallback), *factor)
                        .await
                }
                RecoveryAction::RollbackDeployment { deployment } => {
                    self.actions.rollback_deployment(deployment.as_deref()).await
                }
                RecoveryAction::Wait { seconds } => {
                    tokio::time::sleep(Duration::from_secs(*seconds)).await;
                    Ok(format!("waited {}s", seconds))
                }
            };

            match outcome {
                Ok(detail) => {
                    self.record(incident.id, action.name(), procedure, true, detail);
                }
                Err(e) => {
                    self.record(incident.id, action.name(), procedure, false, e.to_string());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Re-check the metric that raised the incident. Incidents without a
    /// metric (or handlers without a verifier) rely on the actions alone.
    async fn verify(&self, incident: &Incident, procedure: &RecoveryProcedure) -> bool {
        let Some(metric) = incident.context.get("metric").and_then(Value::as_str) else {
            return true;
        };
        let Some(verifier) = &self.verifier else {
            return true;
        };
        let threshold = incident
            .context
            .get("threshold_critical")
            .and_then(Value::as_f64);

        let (healthy, detail) = match (verifier.sample(metric).await, threshold) {
            (Ok(Some(value)), Some(threshold)) => (
                value < threshold,
                format!("{} = {} (critical at {})", metric, value, threshold),
            ),
            (Ok(Some(value)), None) => (true, format!("{} = {}", metric, value)),
            (Ok(None), _) => (false, format!("{} unavailable", metric)),
            (Err(e), _) => (false, e.to_string()),
        };

        self.record(incident.id, "verify_metric", procedure, healthy, detail);
        healthy
    }

    /// Resolve with `score` unless someone else already finished the incident.
    fn mark_recovered(&self, id: Uuid, score: f64, procedure: &str) -> Result<Incident> {
        let updated = {
            let mut incidents = self.write();
            let incident = incidents.get_mut(&id).ok_or(IncidentError::NotFound(id))?;
            if incident.status != IncidentStatus::Resolving {
                return Ok(incident.clone());
            }
            incident.effectiveness_score = Some(score);
            incident.status = IncidentStatus::Resolved;
            incident.resolved_at = Some(Utc::now());
            incident.clone()
        };

        debug!(incident_id = %id, status = %updated.status, "Incident transitioned");
        self.emit(Event::IncidentStatusChanged {
            incident_id: id,
            status: updated.status.as_str().to_string(),
            message: Some(format!("Resolved by {}", procedure)),
        });
        Ok(updated)
    }

    fn flag_manual(&self, id: Uuid, reason: &str) -> Result<Incident> {
        let incident = {
            let mut incidents = self.write();
            let incident = incidents.get_mut(&id).ok_or(IncidentError::NotFound(id))?;
            if !incident.is_open() {
                return Ok(incident.clone());
            }
            incident.manual_intervention_required = true;
            incident.record_step("manual_intervention_required", None, false, Some(reason.to_string()));
            incident.clone()
        };
        self.emit(Event::IncidentStatusChanged {
            incident_id: id,
            status: incident.status.as_str().to_string(),
            message: Some(format!("{}; manual intervention required", reason)),
        });
        Ok(incident)
    }

    fn record(&self, id: Uuid, action: &str, procedure: &RecoveryProcedure, success: bool, detail: String) {
        if let Some(incident) = self.write().get_mut(&id) {
            incident.record_step(action, Some(&procedure.name), success, Some(detail));
        }
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Incident)) -> Result<Incident> {
        let mut incidents = self.write();
        let incident = incidents.get_mut(&id).ok_or(IncidentError::NotFound(id))?;
        f(incident);
        Ok(incident.clone())
    }

    fn transition(&self, id: Uuid, to: IncidentStatus, message: Option<String>) -> Result<Incident> {
        let updated = {
            let mut incidents = self.write();
            let incident = incidents.get_mut(&id).ok_or(IncidentError::NotFound(id))?;
            IncidentStateMachine::validate_transition(&incident.status, &to)?;
            incident.status = to;
            match to {
                IncidentStatus::Resolved => incident.resolved_at = Some(Utc::now()),
                IncidentStatus::Closed => incident.closed_at = Some(Utc::now()),
                _ => {}
            }
            incident.clone()
        };

        debug!(incident_id = %id, status = %to, "Incident transitioned");
        self.emit(Event::IncidentStatusChanged {
            incident_id: id,
            status: to.as_str().to_string(),
            message,
        });
        Ok(updated)
    }

    fn enqueue(&self, id: Uuid) {
        let mut queue = self.queue_guard();
        if let Some(tx) = queue.as_ref() {
            if tx.send(id).is_err() {
                debug!(incident_id = %id, "Incident worker gone; not queued");
                *queue = None;
            }
        }
    }

    fn queue_guard(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Uuid>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = &self.event_sink {
            sink.emit(event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Incident>> {
        self.incidents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Incident>> {
        self.incidents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn components_from_context(context: &Map<String, Value>) -> Vec<String> {
    let mut components: Vec<String> = context
        .get("components")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(component) = context.get("component").and_then(Value::as_str) {
        if !components.iter().any(|c| c == component) {
            components.insert(0, component.to_string());
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopActions;

    #[async_trait]
    impl RecoveryActions for NoopActions {
        async fn restart_service(&self, service: &str) -> Result<String> {
            Ok(format!("restarted {}", service))
        }
        async fn clear_cache(&self, cache: &str) -> Result<String> {
            Ok(format!("cleared {}", cache))
        }
        async fn scale_resources(&self, component: &str, factor: f64) -> Result<String> {
            Ok(format!("scaled {} x{}", component, factor))
        }
        async fn rollback_deployment(&self, _deployment: Option<&str>) -> Result<String> {
            Ok("rolled back".to_string())
        }
    }

    fn handler(procedures: Vec<RecoveryProcedure>) -> IncidentHandler {
        IncidentHandler::new(ProcedureRegistry::new(procedures), Arc::new(NoopActions))
    }

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_detect_classifies_and_stores() {
        let handler = handler(vec![]);
        let id = handler.detect_incident(
            "api",
            "Upstream timeout after 30s",
            ctx(json!({"component": "api"})),
            Severity::High,
        );

        let incident = handler.get(id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Detected);
        assert_eq!(
            incident.error_classification,
            flowpilot_core::ErrorClassification::IntegrationFailure
        );
        assert_eq!(incident.affected_components, vec!["api".to_string()]);
        assert!(handler.has_open_incident("api"));
    }

    #[test]
    fn test_components_from_context() {
        let components = components_from_context(&ctx(json!({
            "component": "api",
            "components": ["worker", "api"]
        })));
        assert_eq!(components, vec!["worker".to_string(), "api".to_string()]);
    }

    #[tokio::test]
    async fn test_no_matching_procedure_flags_manual() {
        let handler = handler(vec![RecoveryProcedure::new(
            "disk_cleanup",
            vec![RecoveryAction::Wait { seconds: 0 }],
        )
        .with_patterns(["disk"])]);
        let id = handler.detect_incident("billing", "invoice mismatch", Map::new(), Severity::Medium);

        let incident = handler.process(id).await.unwrap();
        assert!(incident.manual_intervention_required);
        assert_eq!(incident.status, IncidentStatus::Investigating);
        assert!(incident.root_cause.is_some());
        assert!(incident
            .resolution_steps
            .iter()
            .all(|s| s.procedure.is_none()));
        assert_eq!(handler.procedures().list()[0].usage_count, 0);
    }

    #[tokio::test]
    async fn test_resolve_manually() {
        let handler = handler(vec![]);
        let id = handler.detect_incident("api", "boom", Map::new(), Severity::Low);

        assert!(handler.resolve_manually(id, "restarted by hand"));
        let incident = handler.get(id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert_eq!(
            incident.resolution_steps.last().unwrap().detail.as_deref(),
            Some("restarted by hand")
        );

        handler.close(id).unwrap();
        assert!(!handler.resolve_manually(id, "again"));
        assert!(!handler.resolve_manually(Uuid::new_v4(), "unknown"));
        assert!(handler.list_open().is_empty());
    }

    #[tokio::test]
    async fn test_process_is_idempotent_after_resolution() {
        let handler = handler(vec![RecoveryProcedure::new(
            "noop",
            vec![RecoveryAction::Wait { seconds: 0 }],
        )]);
        let id = handler.detect_incident("api", "boom", Map::new(), Severity::High);

        let first = handler.process(id).await.unwrap();
        assert_eq!(first.status, IncidentStatus::Resolved);
        assert_eq!(first.effectiveness_score, Some(1.0));

        let second = handler.process(id).await.unwrap();
        assert_eq!(second.resolution_steps.len(), first.resolution_steps.len());
    }

    /// Fails every restart, but only once a permit is released.
    struct GatedRestart {
        entered: tokio::sync::Notify,
        permits: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl RecoveryActions for GatedRestart {
        async fn restart_service(&self, service: &str) -> Result<String> {
            self.entered.notify_one();
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| IncidentError::action_failed("restart_service", e.to_string()))?;
            permit.forget();
            Err(IncidentError::action_failed("restart_service", format!("{} did not come back", service)))
        }
        async fn clear_cache(&self, cache: &str) -> Result<String> {
            Ok(format!("cleared {}", cache))
        }
        async fn scale_resources(&self, component: &str, factor: f64) -> Result<String> {
            Ok(format!("scaled {} x{}", component, factor))
        }
        async fn rollback_deployment(&self, _deployment: Option<&str>) -> Result<String> {
            Ok("rolled back".to_string())
        }
    }

    #[tokio::test]
    async fn test_manual_resolution_during_recovery_wins() {
        let actions = Arc::new(GatedRestart {
            entered: tokio::sync::Notify::new(),
            permits: tokio::sync::Semaphore::new(0),
        });
        let mut restart = RecoveryProcedure::new(
            "restart",
            vec![RecoveryAction::RestartService { service: None }],
        )
        .with_success_rate(0.5);
        restart.max_retries = 0;
        let handler = Arc::new(IncidentHandler::new(
            ProcedureRegistry::new(vec![restart]),
            actions.clone(),
        ));
        let id = handler.detect_incident("api", "service crashed", Map::new(), Severity::High);

        let processing = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.process(id).await }
        });
        actions.entered.notified().await;

        assert!(handler.resolve_manually(id, "fixed by operator"));
        actions.permits.add_permits(1);

        let incident = processing.await.unwrap().unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert!(!incident.manual_intervention_required);
        assert!(incident.effectiveness_score.is_none());
        assert_eq!(handler.get(id).unwrap().status, IncidentStatus::Resolved);
        let procedure = &handler.procedures().list()[0];
        assert_eq!(procedure.usage_count, 0);
        assert_eq!(procedure.success_rate, 0.5);
    }

    #[tokio::test]
    async fn test_process_unknown_incident() {
        let handler = handler(vec![]);
        let err = handler.process(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, IncidentError::NotFound(_)));
    }
}
