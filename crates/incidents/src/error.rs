use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("Incident not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid incident transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Recovery action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("Recovery procedure {procedure} timed out after {timeout_secs}s")]
    ProcedureTimeout { procedure: String, timeout_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IncidentError {
    pub fn action_failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IncidentError>;
