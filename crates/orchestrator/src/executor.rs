//! Runs a single step: dispatch by type, enforce the timeout, retry with
//! backoff.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use events::{Event, EventSink};
use flowpilot_core::{Step, StepDefinition, StepStatus, StepType};

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::handlers::{self, output, HandlerContext, StepOutput};
use crate::state_machine::StepStateMachine;

/// Identifies the workflow a step runs on behalf of.
#[derive(Debug, Clone, Copy)]
pub struct StepScope {
    pub workflow_id: Uuid,
    pub project_id: Uuid,
}

pub struct StepExecutor {
    config: EngineConfig,
    collaborators: Collaborators,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl StepExecutor {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `step` to a terminal status.
    ///
    /// A failed attempt, including a timeout, is retried while
    /// `retry_count < max_retries`, after `min(2^retry_count, cap)` backoff
    /// units. Configuration errors (see [`OrchestratorError::is_retryable`])
    /// fail the step on the first attempt. Returns the handler's result, or
    /// the last error once the step is `failed`.
    pub fn execute<'a>(
        &'a self,
        scope: StepScope,
        step: &'a mut Step,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<StepOutput>> {
        async move {
            loop {
                self.set_status(scope, step, StepStatus::Running, None)?;
                step.start();

                let attempt = tokio::time::timeout(step.timeout(), self.dispatch(scope, step, context))
                    .await
                    .unwrap_or_else(|_| {
                        Err(OrchestratorError::StepTimeout {
                            step: step.name.clone(),
                            timeout_secs: step.timeout_secs,
                        })
                    });

                match attempt {
                    Ok(result) => {
                        self.set_status(scope, step, StepStatus::Completed, None)?;
                        step.complete(result.clone());
                        info!(
                            workflow_id = %scope.workflow_id,
                            step_id = %step.id,
                            step = %step.name,
                            "Step completed"
                        );
                        return Ok(result);
                    }
                    Err(e) if e.is_retryable() && step.can_retry() => {
                        self.set_status(scope, step, StepStatus::Retrying, Some(e.to_string()))?;
                        let retry = step.begin_retry(e.to_string());
                        let delay = self.config.backoff_delay(retry);
                        warn!(
                            workflow_id = %scope.workflow_id,
                            step_id = %step.id,
                            retry,
                            max_retries = step.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        self.set_status(scope, step, StepStatus::Failed, Some(e.to_string()))?;
                        step.fail(e.to_string());
                        error!(
                            workflow_id = %scope.workflow_id,
                            step_id = %step.id,
                            step = %step.name,
                            attempts = step.retry_count + 1,
                            error = %e,
                            "Step failed"
                        );
                        return Err(e);
                    }
                }
            }
        }
        .boxed()
    }

    async fn dispatch(
        &self,
        scope: StepScope,
        step: &Step,
        context: &ExecutionContext,
    ) -> Result<StepOutput> {
        debug!(step_id = %step.id, step_type = %step.step_type, "Dispatching step");
        let hc = HandlerContext {
            workflow_id: scope.workflow_id,
            project_id: scope.project_id,
            step,
            context,
            collaborators: &self.collaborators,
            event_sink: self.event_sink.as_ref(),
            config: &self.config,
        };

        match step.step_type {
            StepType::Analysis => handlers::analysis::run(&hc).await,
            StepType::AgentExecution => handlers::agent::run(&hc).await,
            StepType::PullRequest => handlers::pull_request::run(&hc).await,
            StepType::Deployment => handlers::deployment::run(&hc).await,
            StepType::Validation => handlers::validation::run(&hc).await,
            StepType::Notification => handlers::notification::run(&hc).await,
            StepType::Conditional => handlers::conditional::run(&hc).await,
            StepType::ParallelGroup => self.parallel_group(scope, step, context).await,
            StepType::Command => handlers::command::run_command(&hc).await,
            StepType::Script => handlers::command::run_script(&hc).await,
        }
    }

    /// Run the sub-steps in `config.steps` with at most `max_concurrency`
    /// (or the engine's group limit) in flight. Sub-steps retry on their own.
    async fn parallel_group(
        &self,
        scope: StepScope,
        step: &Step,
        context: &ExecutionContext,
    ) -> Result<StepOutput> {
        let mut sub_steps = sub_step_definitions(step)?
            .into_iter()
            .map(|def| {
                def.into_step(
                    self.config.default_max_retries,
                    self.config.default_step_timeout_secs,
                )
            })
            .collect::<Vec<_>>();
        let limit = step
            .config_u64("max_concurrency")
            .map(|n| n.max(1) as usize)
            .unwrap_or(self.config.parallel_group_limit);

        debug!(step_id = %step.id, sub_steps = sub_steps.len(), limit, "Starting parallel group");
        let pending: Vec<BoxFuture<'_, Result<StepOutput>>> = sub_steps
            .iter_mut()
            .map(|sub| self.execute(scope, sub, context))
            .collect();
        let outcomes: Vec<Result<StepOutput>> =
            futures::stream::iter(pending)
                .buffer_unordered(limit)
                .collect()
                .await;

        let failed: Vec<&str> = sub_steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.as_str())
            .collect();
        if outcomes.iter().any(Result::is_err) {
            return Err(OrchestratorError::handler_failed(format!(
                "parallel group '{}' had failing sub-steps: {}",
                step.name,
                failed.join(", ")
            )));
        }

        let summary: Vec<Value> = sub_steps
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "name": s.name,
                    "status": s.status.as_str(),
                    "result": s.result,
                })
            })
            .collect();
        Ok(output([
            ("completed", json!(summary.len())),
            ("sub_steps", Value::Array(summary)),
        ]))
    }

    fn set_status(
        &self,
        scope: StepScope,
        step: &Step,
        to: StepStatus,
        message: Option<String>,
    ) -> Result<()> {
        StepStateMachine::validate_transition(&step.status, &to)?;
        if let Some(sink) = &self.event_sink {
            sink.emit(Event::StepStatusChanged {
                workflow_id: scope.workflow_id,
                step_id: step.id,
                step_name: step.name.clone(),
                status: to.as_str().to_string(),
                message,
            });
        }
        Ok(())
    }
}

/// Parse `config.steps`. Type tags are checked before deserializing so an
/// unknown one reports `UnknownStepType` rather than a serde message.
fn sub_step_definitions(step: &Step) -> Result<Vec<StepDefinition>> {
    let items = match step.config.get("steps") {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(OrchestratorError::handler_failed(format!(
                "parallel_group step '{}' requires config 'steps'",
                step.name
            )))
        }
    };

    items
        .iter()
        .map(|item| {
            let tag = item.get("type").and_then(Value::as_str).unwrap_or_default();
            tag.parse::<StepType>()
                .map_err(|_| OrchestratorError::UnknownStepType(tag.to_string()))?;
            Ok(serde_json::from_value(item.clone())?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AnalysisReport, CodeAnalysis};
    use async_trait::async_trait;
    use events::EventBus;
    use flowpilot_core::Workflow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyAnalysis {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl CodeAnalysis for FlakyAnalysis {
        async fn analyze(&self, _project_id: Uuid, _target: &str) -> Result<AnalysisReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(OrchestratorError::collaborator("analysis backend unavailable"))
            } else {
                Ok(AnalysisReport::default())
            }
        }
    }

    fn scope() -> StepScope {
        StepScope {
            workflow_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
        }
    }

    fn executor_with(analysis: Arc<FlakyAnalysis>) -> StepExecutor {
        StepExecutor::new(
            EngineConfig::default(),
            Collaborators::new().with_analysis(analysis),
        )
    }

    fn context() -> ExecutionContext {
        ExecutionContext::for_workflow(&Workflow::new("w", Uuid::nil()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let analysis = Arc::new(FlakyAnalysis {
            calls: AtomicU32::new(0),
            failures: 2,
        });
        let executor = executor_with(analysis.clone());
        let mut step = Step::new("analyze", StepType::Analysis);

        let started = tokio::time::Instant::now();
        executor.execute(scope(), &mut step, &context()).await.unwrap();

        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.retry_count, 2);
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let analysis = Arc::new(FlakyAnalysis {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        });
        let executor = executor_with(analysis.clone());
        let mut step = Step::new("analyze", StepType::Analysis).with_max_retries(2);

        assert!(executor.execute(scope(), &mut step, &context()).await.is_err());
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 3);
        assert!(step.error.as_deref().unwrap_or_default().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let executor = StepExecutor::new(EngineConfig::default(), Collaborators::new());
        let mut step = Step::new("slow", StepType::Script)
            .with_param("script", "sleep 30")
            .with_timeout_secs(1)
            .with_max_retries(0);

        let err = executor
            .execute(scope(), &mut step, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StepTimeout { .. }));
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_not_retried() {
        let executor = StepExecutor::new(EngineConfig::default(), Collaborators::new());
        let mut step = Step::new("analyze", StepType::Analysis);

        let err = executor
            .execute(scope(), &mut step, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingCollaborator(_)));
        assert_eq!(step.retry_count, 0);
    }

    #[tokio::test]
    async fn test_status_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let executor = StepExecutor::new(EngineConfig::default(), Collaborators::new())
            .with_event_sink(Arc::new(bus));
        let mut step = Step::new("greet", StepType::Command).with_param("command", "true");

        executor.execute(scope(), &mut step, &context()).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            statuses.push(envelope.event.status().unwrap_or_default());
        }
        assert_eq!(statuses, vec!["running", "completed"]);
    }

    #[tokio::test]
    async fn test_parallel_group() {
        let executor = StepExecutor::new(EngineConfig::default(), Collaborators::new());
        let mut step = Step::new("fan-out", StepType::ParallelGroup)
            .with_param(
                "steps",
                json!([
                    {"name": "a", "type": "command", "config": {"command": "echo", "args": ["a"]}},
                    {"name": "b", "type": "script", "config": {"script": "echo b"}}
                ]),
            )
            .with_param("max_concurrency", 2);

        let result = executor.execute(scope(), &mut step, &context()).await.unwrap();
        assert_eq!(result["completed"], json!(2));
        let names: Vec<&str> = result["sub_steps"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_parallel_group_fails_with_any_sub_step() {
        let executor = StepExecutor::new(EngineConfig::default(), Collaborators::new());
        let mut step = Step::new("fan-out", StepType::ParallelGroup)
            .with_max_retries(0)
            .with_param(
                "steps",
                json!([
                    {"name": "ok", "type": "script", "config": {"script": "true"}},
                    {"name": "bad", "type": "script", "max_retries": 0, "config": {"script": "exit 1"}}
                ]),
            );

        let err = executor
            .execute(scope(), &mut step, &context())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test]
    async fn test_parallel_group_rejects_unknown_type() {
        let executor = StepExecutor::new(EngineConfig::default(), Collaborators::new());
        let mut step = Step::new("fan-out", StepType::ParallelGroup)
            .with_param("steps", json!([{"name": "x", "type": "teleport"}]));

        let err = executor
            .execute(scope(), &mut step, &context())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownStepType(ref t) if t == "teleport"));
    }
}
