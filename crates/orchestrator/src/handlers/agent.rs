use serde_json::json;
use tracing::{debug, info};

use super::{output, HandlerContext, StepOutput};
use crate::collaborators::AgentRunStatus;
use crate::error::{OrchestratorError, Result};

/// Submit `prompt` to the automation agent and poll until the run reaches a
/// terminal status. The step timeout bounds the polling.
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let prompt = hc.require_str("prompt")?;
    let repository = hc.param_str("repository")?;
    let agent = hc.collaborators.agent()?;

    let run_id = agent.submit(&prompt, repository.as_deref()).await?;
    info!(step_id = %hc.step.id, run_id = %run_id, "Agent run submitted");

    let mut polls = 0u32;
    let run = loop {
        tokio::time::sleep(hc.config.agent_poll_interval()).await;
        polls += 1;

        let run = agent.status(&run_id).await?;
        debug!(run_id = %run_id, status = run.status.as_str(), polls, "Polled agent run");
        if run.status.is_terminal() {
            break run;
        }
    };

    match run.status {
        AgentRunStatus::Succeeded => Ok(output([
            ("run_id", json!(run_id)),
            ("status", json!(run.status.as_str())),
            ("output", json!(run.output)),
            ("polls", json!(polls)),
        ])),
        _ => Err(OrchestratorError::handler_failed(format!(
            "agent run {} {}: {}",
            run_id,
            run.status.as_str(),
            run.error.as_deref().unwrap_or("no error reported")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AgentRun, AutomationAgent};
    use crate::handlers::test_support::Fixture;
    use async_trait::async_trait;
    use flowpilot_core::StepType;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Reports `running` for the first `polls_until_done` polls.
    struct ScriptedAgent {
        polls_until_done: u32,
        polls: AtomicU32,
        outcome: AgentRunStatus,
    }

    #[async_trait]
    impl AutomationAgent for ScriptedAgent {
        async fn submit(&self, prompt: &str, _repository: Option<&str>) -> Result<String> {
            assert_eq!(prompt, "Fix issue in https://x/pr/1");
            Ok("run-1".to_string())
        }

        async fn status(&self, run_id: &str) -> Result<AgentRun> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let status = if n < self.polls_until_done {
                AgentRunStatus::Running
            } else {
                self.outcome
            };
            Ok(AgentRun {
                id: run_id.to_string(),
                status,
                output: Some("patched".to_string()),
                error: Some("tests failed".to_string()),
            })
        }
    }

    fn fixture(outcome: AgentRunStatus) -> Fixture {
        let mut fixture = Fixture::new(
            StepType::AgentExecution,
            json!({"prompt": "Fix issue in ${steps.pr.url}"}),
        )
        .with_result("pr", json!({"url": "https://x/pr/1"}));
        fixture.collaborators = fixture.collaborators.clone().with_agent(Arc::new(ScriptedAgent {
            polls_until_done: 3,
            polls: AtomicU32::new(0),
            outcome,
        }));
        fixture
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_terminal() {
        let fixture = fixture(AgentRunStatus::Succeeded);
        let result = run(&fixture.handler_context()).await.unwrap();
        assert_eq!(result["polls"], json!(3));
        assert_eq!(result["output"], json!("patched"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_fails_step() {
        let fixture = fixture(AgentRunStatus::Failed);
        let err = run(&fixture.handler_context()).await.unwrap_err();
        assert!(err.to_string().contains("tests failed"));
    }
}
