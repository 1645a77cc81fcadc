//! The orchestrator loop: resolve ready steps, run them as one batch,
//! publish their results and progress, repeat until the workflow settles.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use events::{Event, EventSink};
use flowpilot_core::{
    Severity, Step, StepDefinition, StepStatus, Workflow, WorkflowStatus, WorkflowSummary,
};
use incidents::IncidentHandler;

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::executor::{StepExecutor, StepScope};
use crate::metrics::EngineMetrics;
use crate::resolver::DependencyResolver;
use crate::state_machine::{StepStateMachine, WorkflowStateMachine};
use crate::store::{Entry, WorkflowStore};

/// Intake shape for a whole workflow. `dependencies` maps a step (by id or
/// unique name) to the steps it waits for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub project_id: Uuid,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
}

pub struct WorkflowEngine {
    store: Arc<WorkflowStore>,
    executor: StepExecutor,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    incidents: Option<Arc<IncidentHandler>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            store: Arc::new(WorkflowStore::new(config.retention())),
            executor: StepExecutor::new(config.clone(), collaborators),
            config,
            metrics: Arc::new(EngineMetrics::default()),
            incidents: None,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(sink.clone());
        self.event_sink = Some(sink);
        self
    }

    /// Steps that fail for good are reported to `handler` as incidents.
    pub fn with_incident_handler(mut self, handler: Arc<IncidentHandler>) -> Self {
        self.incidents = Some(handler);
        self
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a pending workflow built from `steps` and `dependencies`.
    pub fn create_workflow(
        &self,
        project_id: Uuid,
        steps: Vec<StepDefinition>,
        dependencies: HashMap<String, Vec<String>>,
    ) -> Result<Uuid> {
        self.create_from_definition(WorkflowDefinition {
            name: "workflow".to_string(),
            project_id,
            metadata: Map::new(),
            steps,
            dependencies,
        })
    }

    /// Build and register a workflow. Unknown references and cycles are
    /// rejected here, before anything runs.
    pub fn create_from_definition(&self, definition: WorkflowDefinition) -> Result<Uuid> {
        let mut workflow = Workflow::new(definition.name, definition.project_id);
        workflow.metadata = definition.metadata;
        workflow.steps = definition
            .steps
            .into_iter()
            .map(|def| {
                def.into_step(
                    self.config.default_max_retries,
                    self.config.default_step_timeout_secs,
                )
            })
            .collect();

        for (step_ref, prerequisites) in &definition.dependencies {
            let step = resolve_ref(&workflow, step_ref)?;
            for prerequisite in prerequisites {
                let prerequisite = resolve_ref(&workflow, prerequisite)?;
                workflow.add_dependency(step, prerequisite);
            }
        }
        DependencyResolver::validate(&workflow)?;

        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            "Workflow created"
        );
        Ok(self.store.insert(workflow))
    }

    /// Register an already-built workflow as is, without graph validation.
    pub fn restore(&self, workflow: Workflow) -> Uuid {
        self.store.insert(workflow)
    }

    pub fn status(&self, id: Uuid) -> Option<Workflow> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<WorkflowSummary> {
        self.store.list()
    }

    pub fn prune_expired(&self) -> usize {
        self.store.prune_expired()
    }

    /// Start a pending workflow and drive it to a settled state on the
    /// current task.
    ///
    /// Returns the workflow once it is terminal or paused. A stuck graph
    /// fails the workflow and is returned as `StuckWorkflow`.
    pub async fn run(&self, id: Uuid) -> Result<Workflow> {
        self.begin(id)?;
        self.drive(id).await
    }

    /// Like [`run`](Self::run), on a spawned task.
    pub fn start(self: &Arc<Self>, id: Uuid) -> Result<JoinHandle<Result<Workflow>>> {
        self.begin(id)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.drive(id).await }))
    }

    /// Only valid from `running`. Steps already in flight finish first.
    pub fn pause(&self, id: Uuid) -> bool {
        self.external_transition(id, WorkflowStatus::Paused).is_some()
    }

    /// Only valid from `paused`. Spawns a driver unless the previous one is
    /// still finishing its batch.
    pub fn resume(self: &Arc<Self>, id: Uuid) -> bool {
        match self.external_transition(id, WorkflowStatus::Running) {
            Some(true) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = engine.drive(id).await {
                        error!(workflow_id = %id, error = %e, "Resumed workflow failed");
                    }
                });
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Valid from `running` or `paused`. In-flight steps finish but nothing
    /// new starts; while a batch is still running the workflow stays
    /// `running` and turns `cancelled` when the batch drains.
    pub fn cancel(&self, id: Uuid) -> bool {
        let outcome = self
            .store
            .update_entry(id, |entry| {
                let from = entry.workflow.status;
                if !WorkflowStateMachine::can_transition(&from, &WorkflowStatus::Cancelled) {
                    return None;
                }
                if entry.driver_active {
                    entry.cancel_requested = true;
                    Some(None)
                } else {
                    Some(Some(mark_cancelled(entry)))
                }
            })
            .ok()
            .flatten();

        match outcome {
            Some(Some(from)) => {
                info!(workflow_id = %id, from = %from.as_str(), "Workflow cancelled");
                self.emit_status(id, from, WorkflowStatus::Cancelled, None);
                true
            }
            Some(None) => {
                info!(workflow_id = %id, "Cancellation requested; waiting for the running batch");
                true
            }
            None => false,
        }
    }

    /// Apply an externally requested status change. `None` when the
    /// transition is not allowed; otherwise whether the caller must spawn a
    /// driver.
    fn external_transition(&self, id: Uuid, to: WorkflowStatus) -> Option<bool> {
        let outcome = self
            .store
            .update_entry(id, |entry| {
                let from = entry.workflow.status;
                // pending workflows are started, not resumed
                if from == WorkflowStatus::Pending
                    || entry.cancel_requested
                    || !WorkflowStateMachine::can_transition(&from, &to)
                {
                    return None;
                }
                entry.workflow.status = to;
                let spawn = to == WorkflowStatus::Running && !entry.driver_active;
                if spawn {
                    entry.driver_active = true;
                }
                Some((from, spawn))
            })
            .ok()
            .flatten()?;

        let (from, spawn) = outcome;
        info!(workflow_id = %id, from = %from.as_str(), to = %to.as_str(), "Workflow status changed");
        self.emit_status(id, from, to, None);
        Some(spawn)
    }

    fn begin(&self, id: Uuid) -> Result<()> {
        let (total_steps, from) = self.store.update_entry(id, |entry| {
            let from = entry.workflow.status;
            WorkflowStateMachine::validate_transition(&from, &WorkflowStatus::Running)?;
            entry.workflow.status = WorkflowStatus::Running;
            entry.workflow.started_at = Some(Utc::now());
            entry.driver_active = true;
            Ok::<_, OrchestratorError>((entry.workflow.steps.len(), from))
        })??;

        info!(workflow_id = %id, steps = total_steps, "Workflow started");
        self.emit_status(id, from, WorkflowStatus::Running, None);
        self.emit(Event::WorkflowProgress {
            workflow_id: id,
            progress_percentage: 0,
            done_steps: 0,
            total_steps,
        });
        Ok(())
    }

    async fn drive(&self, id: Uuid) -> Result<Workflow> {
        let mut context = self
            .store
            .get(id)
            .map(|w| ExecutionContext::for_workflow(&w))
            .ok_or(OrchestratorError::WorkflowNotFound(id))?;

        loop {
            let gate = self.store.update_entry(id, |entry| {
                let status = entry.workflow.status;
                if entry.cancel_requested
                    && WorkflowStateMachine::can_transition(&status, &WorkflowStatus::Cancelled)
                {
                    entry.driver_active = false;
                    Gate::Cancelled(mark_cancelled(entry))
                } else if status == WorkflowStatus::Running {
                    Gate::Run
                } else {
                    entry.driver_active = false;
                    Gate::Stop
                }
            })?;
            if gate != Gate::Run {
                if let Gate::Cancelled(from) = gate {
                    info!(workflow_id = %id, from = %from.as_str(), "Workflow cancelled");
                    self.emit_status(id, from, WorkflowStatus::Cancelled, None);
                }
                let workflow = self.snapshot(id)?;
                debug!(workflow_id = %id, status = %workflow.status.as_str(), "Driver stopping");
                return Ok(workflow);
            }

            self.settle_pending(id, &mut context)?;

            let workflow = self.snapshot(id)?;
            if DependencyResolver::is_complete(&workflow) || DependencyResolver::has_failed(&workflow)
            {
                return self.finalize(id);
            }

            let ready = DependencyResolver::ready_steps(&workflow);
            if ready.is_empty() {
                return Err(self.fail_stuck(&workflow));
            }

            self.run_batch(&workflow, &ready, &mut context).await?;

            let (progress, done_steps, total_steps) = self.store.update(id, |w| {
                let progress = w.recompute_progress();
                let done = w.steps.iter().filter(|s| s.status.is_done()).count();
                (progress, done, w.steps.len())
            })?;
            debug!(workflow_id = %id, progress, "Batch settled");
            self.emit(Event::WorkflowProgress {
                workflow_id: id,
                progress_percentage: progress,
                done_steps,
                total_steps,
            });
        }
    }

    /// Skip steps whose prerequisite was skipped or whose `run_if` is false,
    /// until nothing changes.
    fn settle_pending(&self, id: Uuid, context: &mut ExecutionContext) -> Result<()> {
        loop {
            let workflow = self.snapshot(id)?;
            let mut decisions: Vec<(Uuid, std::result::Result<String, String>)> =
                DependencyResolver::blocked_by_skip(&workflow)
                    .into_iter()
                    .map(|step_id| (step_id, Ok("dependency skipped".to_string())))
                    .collect();

            for step_id in DependencyResolver::ready_steps(&workflow) {
                let Some(condition) = workflow.step(step_id).and_then(|s| s.config_str("run_if"))
                else {
                    continue;
                };
                match context.evaluate(condition) {
                    Ok(true) => {}
                    Ok(false) => decisions.push((step_id, Ok(format!("run_if false: {}", condition)))),
                    Err(e) => decisions.push((step_id, Err(e.to_string()))),
                }
            }

            if decisions.is_empty() {
                return Ok(());
            }

            let changed: Vec<Step> = self.store.update(id, |w| {
                decisions
                    .into_iter()
                    .filter_map(|(step_id, decision)| {
                        let step = w.step_mut(step_id)?;
                        if step.status != StepStatus::Pending {
                            return None;
                        }
                        match decision {
                            Ok(reason) => step.skip(reason),
                            Err(error) => {
                                step.start();
                                step.fail(error);
                            }
                        }
                        Some(step.clone())
                    })
                    .collect()
            })?;

            if changed.is_empty() {
                return Ok(());
            }
            for step in &changed {
                debug!(workflow_id = %id, step_id = %step.id, status = %step.status.as_str(), "Step settled without running");
                if let Err(e) = context.record(step) {
                    warn!(workflow_id = %id, step_id = %step.id, error = %e, "Context already held step result");
                }
                self.emit(Event::StepStatusChanged {
                    workflow_id: id,
                    step_id: step.id,
                    step_name: step.name.clone(),
                    status: step.status.as_str().to_string(),
                    message: step.error.clone(),
                });
            }
        }
    }

    async fn run_batch(
        &self,
        workflow: &Workflow,
        ready: &[Uuid],
        context: &mut ExecutionContext,
    ) -> Result<()> {
        let id = workflow.id;
        let mut batch: Vec<Step> = ready
            .iter()
            .filter_map(|step_id| workflow.step(*step_id).cloned())
            .collect();

        self.store.update(id, |w| {
            for step_id in ready {
                if let Some(step) = w.step_mut(*step_id) {
                    if StepStateMachine::can_transition(&step.status, &StepStatus::Running) {
                        step.start();
                    }
                }
            }
        })?;

        info!(workflow_id = %id, batch = batch.len(), "Executing batch");
        let scope = StepScope {
            workflow_id: id,
            project_id: workflow.project_id,
        };
        let shared: &ExecutionContext = context;
        let durations = futures::future::join_all(batch.iter_mut().map(|step| async move {
            let started = Instant::now();
            let _ = self.executor.execute(scope, step, shared).await;
            started.elapsed()
        }))
        .await;

        self.store.update(id, |w| {
            for step in &batch {
                if let Some(slot) = w.step_mut(step.id) {
                    *slot = step.clone();
                }
            }
        })?;

        for (step, duration) in batch.iter().zip(durations) {
            let success = step.status == StepStatus::Completed;
            self.metrics.record_step(success, duration);
            if let Err(e) = context.record(step) {
                warn!(workflow_id = %id, step_id = %step.id, error = %e, "Context already held step result");
            }
            if step.status == StepStatus::Failed {
                self.escalate(workflow, step);
            }
        }
        Ok(())
    }

    fn finalize(&self, id: Uuid) -> Result<Workflow> {
        let outcome = self.store.update(id, |w| {
            let failed: Vec<String> = w.failed_steps().iter().map(|s| s.name.clone()).collect();
            let to = if failed.is_empty() {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
            if !WorkflowStateMachine::can_transition(&w.status, &to) {
                return None;
            }
            let from = w.status;
            w.status = to;
            w.completed_at = Some(Utc::now());
            w.recompute_progress();
            if !failed.is_empty() {
                w.error = Some(format!("Steps failed: {}", failed.join(", ")));
            }
            Some((from, to, w.error.clone()))
        })?;

        if let Some((from, to, message)) = outcome {
            if to == WorkflowStatus::Failed {
                self.metrics.record_workflow_failed(false);
                error!(workflow_id = %id, error = ?message, "Workflow failed");
            } else {
                info!(workflow_id = %id, "Workflow completed");
            }
            self.emit_status(id, from, to, message);
        }
        self.snapshot(id)
    }

    fn fail_stuck(&self, workflow: &Workflow) -> OrchestratorError {
        let pending: Vec<String> = workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.name.clone())
            .collect();
        let err = OrchestratorError::StuckWorkflow {
            workflow_id: workflow.id,
            pending,
        };
        error!(workflow_id = %workflow.id, error = %err, "Workflow is stuck");

        let message = err.to_string();
        let transitioned = self
            .store
            .update(workflow.id, |w| {
                if !WorkflowStateMachine::can_transition(&w.status, &WorkflowStatus::Failed) {
                    return None;
                }
                let from = w.status;
                w.status = WorkflowStatus::Failed;
                w.completed_at = Some(Utc::now());
                w.error = Some(message.clone());
                Some(from)
            })
            .ok()
            .flatten();

        if let Some(from) = transitioned {
            self.metrics.record_workflow_failed(true);
            self.emit_status(workflow.id, from, WorkflowStatus::Failed, Some(message));
        }
        err
    }

    /// Report a step that failed for good. Fire-and-forget.
    fn escalate(&self, workflow: &Workflow, step: &Step) {
        let Some(handler) = &self.incidents else {
            return;
        };
        let error = step.error.as_deref().unwrap_or("unknown error");
        let mut context = Map::new();
        context.insert("workflow_id".to_string(), json!(workflow.id));
        context.insert("step_id".to_string(), json!(step.id));
        context.insert("step_type".to_string(), json!(step.step_type.as_str()));
        context.insert("component".to_string(), json!("worker"));

        let incident_id = handler.detect_incident(
            "step_failure",
            &format!("step '{}' failed in workflow '{}': {}", step.name, workflow.name, error),
            context,
            Severity::High,
        );
        warn!(workflow_id = %workflow.id, step_id = %step.id, incident_id = %incident_id, "Step failure escalated");
    }

    fn snapshot(&self, id: Uuid) -> Result<Workflow> {
        self.store
            .get(id)
            .ok_or(OrchestratorError::WorkflowNotFound(id))
    }

    fn emit_status(&self, id: Uuid, from: WorkflowStatus, to: WorkflowStatus, message: Option<String>) {
        self.emit(Event::WorkflowStatusChanged {
            workflow_id: id,
            from_status: from.as_str().to_string(),
            to_status: to.as_str().to_string(),
            message,
        });
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = &self.event_sink {
            sink.emit(event);
        }
    }
}

/// A step reference is its uuid or its name; names must be unique.
fn resolve_ref(workflow: &Workflow, reference: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(reference) {
        if workflow.step(id).is_some() {
            return Ok(id);
        }
    }
    let mut named = workflow.steps.iter().filter(|s| s.name == reference);
    match (named.next(), named.next()) {
        (Some(step), None) => Ok(step.id),
        (Some(_), Some(_)) => Err(OrchestratorError::InvalidGraph(format!(
            "step name '{}' is ambiguous",
            reference
        ))),
        (None, _) => Err(OrchestratorError::InvalidGraph(format!(
            "unknown step '{}'",
            reference
        ))),
    }
}

/// What the driver does at the top of each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Run,
    Stop,
    Cancelled(WorkflowStatus),
}

fn mark_cancelled(entry: &mut Entry) -> WorkflowStatus {
    let from = entry.workflow.status;
    entry.workflow.status = WorkflowStatus::Cancelled;
    entry.workflow.completed_at = Some(Utc::now());
    entry.cancel_requested = false;
    from
}
