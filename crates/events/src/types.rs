//! Event types for the flowpilot event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }

    /// Flatten into the `{type, target_id, status, message, timestamp}` record
    /// external subscribers consume.
    pub fn record(&self) -> EventRecord {
        EventRecord {
            event_type: self.event.event_type().to_string(),
            target_id: self.event.target_id(),
            status: self.event.status(),
            message: self.event.message(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub target_id: Option<Uuid>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Workflow events
    /// Workflow status changed
    #[serde(rename = "workflow.status_changed")]
    WorkflowStatusChanged {
        workflow_id: Uuid,
        from_status: String,
        to_status: String,
        message: Option<String>,
    },

    /// Progress recomputed after a batch settled
    #[serde(rename = "workflow.progress")]
    WorkflowProgress {
        workflow_id: Uuid,
        progress_percentage: u8,
        done_steps: usize,
        total_steps: usize,
    },

    // Step events
    #[serde(rename = "step.status_changed")]
    StepStatusChanged {
        workflow_id: Uuid,
        step_id: Uuid,
        step_name: String,
        status: String,
        message: Option<String>,
    },

    // Incident events
    #[serde(rename = "incident.detected")]
    IncidentDetected {
        incident_id: Uuid,
        incident_type: String,
        severity: String,
        message: String,
    },

    #[serde(rename = "incident.status_changed")]
    IncidentStatusChanged {
        incident_id: Uuid,
        status: String,
        message: Option<String>,
    },

    /// Summary of one health monitoring cycle
    #[serde(rename = "health.report")]
    HealthReport {
        score: u32,
        critical: Vec<String>,
        warning: Vec<String>,
    },

    /// Message produced by a notification step
    #[serde(rename = "notification")]
    Notification {
        target_id: Option<Uuid>,
        channel: String,
        message: String,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::WorkflowStatusChanged { .. } => "workflow.status_changed",
            Event::WorkflowProgress { .. } => "workflow.progress",
            Event::StepStatusChanged { .. } => "step.status_changed",
            Event::IncidentDetected { .. } => "incident.detected",
            Event::IncidentStatusChanged { .. } => "incident.status_changed",
            Event::HealthReport { .. } => "health.report",
            Event::Notification { .. } => "notification",
            Event::Error { .. } => "error",
        }
    }

    /// Id of the workflow, step or incident the event is about, if any
    pub fn target_id(&self) -> Option<Uuid> {
        match self {
            Event::WorkflowStatusChanged { workflow_id, .. } => Some(*workflow_id),
            Event::WorkflowProgress { workflow_id, .. } => Some(*workflow_id),
            Event::StepStatusChanged { step_id, .. } => Some(*step_id),
            Event::IncidentDetected { incident_id, .. } => Some(*incident_id),
            Event::IncidentStatusChanged { incident_id, .. } => Some(*incident_id),
            Event::Notification { target_id, .. } => *target_id,
            Event::HealthReport { .. } | Event::Error { .. } => None,
        }
    }

    pub fn status(&self) -> Option<String> {
        match self {
            Event::WorkflowStatusChanged { to_status, .. } => Some(to_status.clone()),
            Event::StepStatusChanged { status, .. } => Some(status.clone()),
            Event::IncidentDetected { .. } => Some("detected".to_string()),
            Event::IncidentStatusChanged { status, .. } => Some(status.clone()),
            Event::WorkflowProgress {
                progress_percentage,
                ..
            } => Some(format!("{}%", progress_percentage)),
            Event::HealthReport { score, .. } => Some(score.to_string()),
            Event::Notification { .. } | Event::Error { .. } => None,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Event::WorkflowStatusChanged { message, .. }
            | Event::StepStatusChanged { message, .. }
            | Event::IncidentStatusChanged { message, .. } => message.clone(),
            Event::IncidentDetected { message, .. }
            | Event::Notification { message, .. }
            | Event::Error { message, .. } => Some(message.clone()),
            Event::WorkflowProgress {
                done_steps,
                total_steps,
                ..
            } => Some(format!("{}/{} steps done", done_steps, total_steps)),
            Event::HealthReport {
                critical, warning, ..
            } => Some(format!(
                "{} critical, {} warning",
                critical.len(),
                warning.len()
            )),
        }
    }
}
