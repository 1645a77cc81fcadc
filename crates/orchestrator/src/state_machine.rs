use flowpilot_core::{StepStatus, WorkflowStatus};

use crate::error::{OrchestratorError, Result};

pub struct WorkflowStateMachine;

impl WorkflowStateMachine {
    pub fn validate_transition(from: &WorkflowStatus, to: &WorkflowStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &WorkflowStatus) -> Vec<WorkflowStatus> {
        match from {
            WorkflowStatus::Pending => vec![WorkflowStatus::Running],
            WorkflowStatus::Running => vec![
                WorkflowStatus::Paused,
                WorkflowStatus::Completed,
                WorkflowStatus::Failed,
                WorkflowStatus::Cancelled,
            ],
            WorkflowStatus::Paused => vec![WorkflowStatus::Running, WorkflowStatus::Cancelled],
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                vec![]
            }
        }
    }

    pub fn can_transition(from: &WorkflowStatus, to: &WorkflowStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

pub struct StepStateMachine;

impl StepStateMachine {
    pub fn validate_transition(from: &StepStatus, to: &StepStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &StepStatus) -> Vec<StepStatus> {
        match from {
            StepStatus::Pending => vec![StepStatus::Running, StepStatus::Skipped],
            StepStatus::Running => vec![
                StepStatus::Completed,
                StepStatus::Failed,
                StepStatus::Retrying,
            ],
            StepStatus::Retrying => vec![StepStatus::Running],
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => vec![],
        }
    }

    pub fn can_transition(from: &StepStatus, to: &StepStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
