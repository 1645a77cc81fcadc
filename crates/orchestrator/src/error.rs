use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("Workflow {workflow_id} is stuck: no step is ready among pending {pending:?}")]
    StuckWorkflow {
        workflow_id: Uuid,
        pending: Vec<String>,
    },

    #[error("Invalid dependency graph: {0}")]
    InvalidGraph(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("No {0} collaborator configured")]
    MissingCollaborator(&'static str),

    #[error("Step {step} timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Step handler failed: {0}")]
    HandlerFailed(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Execution context already holds {0}")]
    ContextConflict(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn handler_failed(reason: impl Into<String>) -> Self {
        Self::HandlerFailed(reason.into())
    }

    pub fn collaborator(reason: impl std::fmt::Display) -> Self {
        Self::Collaborator(reason.to_string())
    }

    pub fn expression(reason: impl Into<String>) -> Self {
        Self::Expression(reason.into())
    }

    /// Configuration problems fail a step at once; everything else is
    /// retried while the step has retries left.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownStepType(_)
                | Self::MissingCollaborator(_)
                | Self::PreconditionFailed(_)
                | Self::InvalidGraph(_)
                | Self::Expression(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuck_error_names_pending_steps() {
        let err = OrchestratorError::StuckWorkflow {
            workflow_id: Uuid::nil(),
            pending: vec!["deploy".to_string()],
        };
        assert!(err.to_string().contains("deploy"));
    }

    #[test]
    fn test_helpers() {
        assert!(matches!(
            OrchestratorError::collaborator("503"),
            OrchestratorError::Collaborator(ref s) if s == "503"
        ));
        assert_eq!(
            OrchestratorError::MissingCollaborator("deployment").to_string(),
            "No deployment collaborator configured"
        );
    }

    #[test]
    fn test_configuration_errors_are_not_retried() {
        assert!(!OrchestratorError::UnknownStepType("x".into()).is_retryable());
        assert!(!OrchestratorError::PreconditionFailed("staging".into()).is_retryable());
        assert!(OrchestratorError::handler_failed("exit 1").is_retryable());
        assert!(OrchestratorError::StepTimeout {
            step: "build".into(),
            timeout_secs: 5
        }
        .is_retryable());
    }
}
