use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use super::step::{Step, StepStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph of steps plus the explicit map of prerequisites for each step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub project_id: Uuid,
    pub status: WorkflowStatus,
    pub steps: Vec<Step>,
    /// step id -> ids of steps that must be `completed` first
    #[serde(default)]
    pub dependencies: HashMap<Uuid, Vec<Uuid>>,
    pub progress_percentage: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, project_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            project_id,
            status: WorkflowStatus::default(),
            steps: Vec::new(),
            dependencies: HashMap::new(),
            progress_percentage: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare that `step` may only run once `prerequisite` has completed.
    pub fn with_dependency(mut self, step: Uuid, prerequisite: Uuid) -> Self {
        self.add_dependency(step, prerequisite);
        self
    }

    pub fn add_dependency(&mut self, step: Uuid, prerequisite: Uuid) {
        let deps = self.dependencies.entry(step).or_default();
        if !deps.contains(&prerequisite) {
            deps.push(prerequisite);
        }
    }

    pub fn dependencies_of(&self, step_id: Uuid) -> &[Uuid] {
        self.dependencies
            .get(&step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn step_status(&self, id: Uuid) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    /// Completed-or-skipped steps as a whole percentage of all steps, rounded down.
    pub fn compute_progress(&self) -> u8 {
        if self.steps.is_empty() {
            return 100;
        }
        let done = self.steps.iter().filter(|s| s.status.is_done()).count();
        ((done * 100) / self.steps.len()) as u8
    }

    pub fn recompute_progress(&mut self) -> u8 {
        self.progress_percentage = self.compute_progress();
        self.progress_percentage
    }

    pub fn failed_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .collect()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            name: self.name.clone(),
            project_id: self.project_id,
            status: self.status,
            progress_percentage: self.progress_percentage,
            total_steps: self.steps.len(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub name: String,
    pub project_id: Uuid,
    pub status: WorkflowStatus,
    pub progress_percentage: u8,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
}
