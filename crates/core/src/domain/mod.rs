mod health;
mod incident;
mod recovery;
mod step;
mod workflow;

pub use health::{health_score, HealthMetric, MetricStatus};
pub use incident::{ErrorClassification, Incident, IncidentStatus, ResolutionStep, Severity};
pub use recovery::{RecoveryAction, RecoveryProcedure};
pub use step::{
    Step, StepConfig, StepDefinition, StepStatus, StepType, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS,
};
pub use workflow::{Workflow, WorkflowStatus, WorkflowSummary};
