use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use events::{EventBus, EventSink};
use flowpilot_core::{IncidentStatus, RecoveryAction, RecoveryProcedure, Severity};
use incidents::{
    HealthMonitor, IncidentError, IncidentHandler, MetricSource, MonitorConfig,
    ProcedureRegistry, RecoveryActions, Result,
};

/// Records every action invoked; fails the ones listed in `failing`.
#[derive(Default)]
struct RecordingActions {
    calls: Mutex<Vec<String>>,
    failing: Vec<&'static str>,
}

impl RecordingActions {
    fn failing(actions: &[&'static str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: actions.to_vec(),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call(&self, action: &'static str, target: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", action, target));
        if self.failing.contains(&action) {
            Err(IncidentError::action_failed(action, "simulated failure"))
        } else {
            Ok(format!("{} ok", action))
        }
    }
}

#[async_trait]
impl RecoveryActions for RecordingActions {
    async fn restart_service(&self, service: &str) -> Result<String> {
        self.call("restart_service", service)
    }
    async fn clear_cache(&self, cache: &str) -> Result<String> {
        self.call("clear_cache", cache)
    }
    async fn scale_resources(&self, component: &str, _factor: f64) -> Result<String> {
        self.call("scale_resources", component)
    }
    async fn rollback_deployment(&self, deployment: Option<&str>) -> Result<String> {
        self.call("rollback_deployment", deployment.unwrap_or("latest"))
    }
}

#[derive(Default)]
struct SettableMetrics {
    values: Mutex<HashMap<String, f64>>,
}

impl SettableMetrics {
    fn set(&self, name: &str, value: f64) {
        self.values.lock().unwrap().insert(name.to_string(), value);
    }
}

#[async_trait]
impl MetricSource for SettableMetrics {
    async fn sample(&self, metric: &str) -> Result<Option<f64>> {
        Ok(self.values.lock().unwrap().get(metric).copied())
    }
}

fn procedure(name: &str, action: RecoveryAction, rate: f64) -> RecoveryProcedure {
    RecoveryProcedure::new(name, vec![action])
        .with_patterns(["timeout"])
        .with_success_rate(rate)
}

fn restart() -> RecoveryAction {
    RecoveryAction::RestartService { service: None }
}

fn clear() -> RecoveryAction {
    RecoveryAction::ClearCache { cache: None }
}

fn context(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_highest_success_rate_attempted_first() {
    let actions = Arc::new(RecordingActions::default());
    let registry = ProcedureRegistry::new(vec![
        procedure("low", clear(), 0.3),
        procedure("high", restart(), 0.9),
    ]);
    let handler = IncidentHandler::new(registry.clone(), actions.clone());

    let id = handler.detect_incident(
        "api",
        "gateway timeout",
        context(json!({"component": "api"})),
        Severity::High,
    );
    let incident = handler.process(id).await.unwrap();

    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.effectiveness_score, Some(1.0));
    assert_eq!(actions.calls(), vec!["restart_service:api"]);
    assert_eq!(
        incident.resolution_steps[0].procedure.as_deref(),
        Some("high")
    );

    let high = registry.get("high").unwrap();
    assert_eq!(high.usage_count, 1);
    assert!((high.success_rate - 1.0).abs() < f64::EPSILON);
    assert_eq!(registry.get("low").unwrap().usage_count, 0);
}

#[tokio::test]
async fn test_falls_through_to_next_procedure() {
    let actions = Arc::new(RecordingActions::failing(&["restart_service"]));
    let registry = ProcedureRegistry::new(vec![
        procedure("high", restart(), 0.9),
        procedure("low", clear(), 0.3),
    ]);
    let handler = IncidentHandler::new(registry.clone(), actions.clone());

    let id = handler.detect_incident("worker", "job timeout", Map::new(), Severity::High);
    let incident = handler.process(id).await.unwrap();

    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.effectiveness_score, Some(0.5));
    assert!(!incident.manual_intervention_required);

    // default max_retries = 1, so the failing procedure runs twice
    assert_eq!(
        actions.calls(),
        vec![
            "restart_service:worker",
            "restart_service:worker",
            "clear_cache:worker"
        ]
    );

    let high = registry.get("high").unwrap();
    assert_eq!(high.usage_count, 1);
    assert_eq!(high.success_rate, 0.0);
    assert_eq!(registry.get("low").unwrap().success_rate, 1.0);
}

#[tokio::test]
async fn test_all_procedures_fail_keeps_audit_trail() {
    let actions = Arc::new(RecordingActions::failing(&["restart_service", "clear_cache"]));
    let registry = ProcedureRegistry::new(vec![
        procedure("restart", restart(), 0.9),
        procedure("clear", clear(), 0.5),
    ]);
    let handler = IncidentHandler::new(registry, actions);

    let id = handler.detect_incident("api", "read timeout", Map::new(), Severity::Critical);
    let incident = handler.process(id).await.unwrap();

    assert!(incident.manual_intervention_required);
    assert_eq!(incident.status, IncidentStatus::Resolving);
    assert!(incident.is_open());

    let attempted: Vec<&str> = incident
        .resolution_steps
        .iter()
        .filter_map(|s| s.procedure.as_deref())
        .collect();
    assert!(attempted.contains(&"restart"));
    assert!(attempted.contains(&"clear"));
    assert!(incident.resolution_steps.iter().all(|s| !s.success));

    // still closable by an operator
    assert!(handler.resolve_manually(id, "failed over to standby"));
    assert_eq!(handler.get(id).unwrap().status, IncidentStatus::Resolved);
}

#[tokio::test]
async fn test_verification_rejects_procedure_when_metric_stays_critical() {
    let actions = Arc::new(RecordingActions::default());
    let metrics = Arc::new(SettableMetrics::default());
    metrics.set("error_rate", 25.0);

    let registry = ProcedureRegistry::new(vec![RecoveryProcedure::new(
        "scale",
        vec![RecoveryAction::ScaleResources {
            component: Some("worker".to_string()),
            factor: 2.0,
        }],
    )]);
    let handler =
        IncidentHandler::new(registry, actions.clone()).with_verifier(metrics.clone());

    let id = handler.detect_incident(
        "error_rate",
        "Metric error_rate is critical",
        context(json!({"metric": "error_rate", "threshold_critical": 10.0})),
        Severity::Critical,
    );
    let incident = handler.process(id).await.unwrap();

    assert!(incident.manual_intervention_required);
    let verifications: Vec<_> = incident
        .resolution_steps
        .iter()
        .filter(|s| s.action == "verify_metric")
        .collect();
    assert_eq!(verifications.len(), 2);
    assert!(verifications.iter().all(|s| !s.success));
}

#[tokio::test]
async fn test_verification_accepts_recovered_metric() {
    let actions = Arc::new(RecordingActions::default());
    let metrics = Arc::new(SettableMetrics::default());
    metrics.set("error_rate", 2.0);

    let registry = ProcedureRegistry::new(vec![RecoveryProcedure::new("scale", vec![clear()])]);
    let handler = IncidentHandler::new(registry, actions).with_verifier(metrics);

    let id = handler.detect_incident(
        "error_rate",
        "Metric error_rate is critical",
        context(json!({"metric": "error_rate", "threshold_critical": 10.0})),
        Severity::Critical,
    );
    let incident = handler.process(id).await.unwrap();

    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert!(incident.resolved_at.is_some());
    let last = incident.resolution_steps.last().unwrap();
    assert_eq!(last.action, "verify_metric");
    assert!(last.success);
}

#[tokio::test(start_paused = true)]
async fn test_procedure_timeout_counts_as_failure() {
    let actions = Arc::new(RecordingActions::default());
    let slow = RecoveryProcedure::new("slow", vec![RecoveryAction::Wait { seconds: 600 }])
        .with_timeout_secs(5);
    let handler = IncidentHandler::new(ProcedureRegistry::new(vec![slow]), actions);

    let id = handler.detect_incident("api", "hang", Map::new(), Severity::High);
    let incident = handler.process(id).await.unwrap();

    assert!(incident.manual_intervention_required);
    let timeouts = incident
        .resolution_steps
        .iter()
        .filter(|s| s.action == "procedure_timeout")
        .count();
    assert_eq!(timeouts, 2);
}

#[tokio::test]
async fn test_lifecycle_events_published() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    let sink: Arc<dyn EventSink> = Arc::new(bus.clone());

    let registry = ProcedureRegistry::new(vec![procedure("restart", restart(), 0.5)]);
    let handler = IncidentHandler::new(registry, Arc::new(RecordingActions::default()))
        .with_event_sink(sink);

    let id = handler.detect_incident("api", "timeout", Map::new(), Severity::High);
    handler.process(id).await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        let record = envelope.record();
        assert_eq!(record.target_id, Some(id));
        statuses.push(record.status.unwrap_or_default());
    }
    assert_eq!(
        statuses,
        vec!["detected", "investigating", "resolving", "resolved"]
    );
}

#[tokio::test]
async fn test_worker_processes_detected_incidents() {
    let registry = ProcedureRegistry::new(vec![procedure("restart", restart(), 0.5)]);
    let handler = Arc::new(IncidentHandler::new(
        registry,
        Arc::new(RecordingActions::default()),
    ));
    let (tx, rx) = watch::channel(false);
    let worker = handler.spawn_worker(rx).expect("first worker");
    assert!(handler.spawn_worker(watch::channel(false).1).is_none());

    let id = handler.detect_incident("api", "connect timeout", Map::new(), Severity::High);

    let mut resolved = false;
    for _ in 0..100 {
        if handler.get(id).map(|i| i.status) == Some(IncidentStatus::Resolved) {
            resolved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(resolved);

    tx.send(true).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_incidents_wait_for_a_worker() {
    let actions = Arc::new(RecordingActions::default());
    let registry = ProcedureRegistry::new(vec![procedure("restart", restart(), 0.5)]);
    let handler = Arc::new(IncidentHandler::new(registry, actions.clone()));

    let early = handler.detect_incident("api", "connect timeout", Map::new(), Severity::High);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handler.get(early).unwrap().status, IncidentStatus::Detected);
    assert!(actions.calls().is_empty());

    let (tx, rx) = watch::channel(false);
    let worker = handler.spawn_worker(rx).expect("worker");

    let mut resolved = false;
    for _ in 0..100 {
        if handler.get(early).map(|i| i.status) == Some(IncidentStatus::Resolved) {
            resolved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(resolved);

    tx.send(true).unwrap();
    worker.await.unwrap();
    assert!(handler.spawn_worker(watch::channel(false).1).is_some());
}

#[tokio::test]
async fn test_monitor_raises_incident_resolved_by_seed_procedure() {
    let metrics = Arc::new(SettableMetrics::default());
    metrics.set("error_rate", 14.0);

    let actions = Arc::new(RecordingActions::default());
    let handler = Arc::new(IncidentHandler::new(ProcedureRegistry::with_seed(), actions.clone()));
    let config = MonitorConfig::empty().with_metric("error_rate", 5.0, 10.0);
    let monitor = HealthMonitor::new(config, metrics.clone(), handler.clone());

    let snapshot = monitor.run_cycle().await;
    assert_eq!(snapshot.score, 70);
    assert_eq!(snapshot.raised.len(), 1);

    // the wait step of resource_scaling would sleep; run it on paused time
    tokio::time::pause();
    let incident = handler.process(snapshot.raised[0]).await.unwrap();
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(actions.calls(), vec!["scale_resources:error_rate"]);
}
