use flowpilot_core::IncidentStatus;

use crate::error::{IncidentError, Result};

pub struct IncidentStateMachine;

impl IncidentStateMachine {
    pub fn validate_transition(from: &IncidentStatus, to: &IncidentStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(IncidentError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &IncidentStatus) -> Vec<IncidentStatus> {
        match from {
            IncidentStatus::Detected => vec![
                IncidentStatus::Investigating,
                IncidentStatus::Resolved,
                IncidentStatus::Closed,
            ],
            IncidentStatus::Investigating => vec![
                IncidentStatus::Resolving,
                IncidentStatus::Resolved,
                IncidentStatus::Closed,
            ],
            IncidentStatus::Resolving => vec![IncidentStatus::Resolved, IncidentStatus::Closed],
            IncidentStatus::Resolved => vec![IncidentStatus::Closed],
            IncidentStatus::Closed => vec![],
        }
    }

    pub fn can_transition(from: &IncidentStatus, to: &IncidentStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
