//! Boundary contracts for the external services step handlers call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Issue counts returned by a code-analysis service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub issues_by_severity: BTreeMap<String, u64>,
    #[serde(default)]
    pub issues_by_type: BTreeMap<String, u64>,
    #[serde(default)]
    pub quality_score: Option<f64>,
}

impl AnalysisReport {
    pub fn total_issues(&self) -> u64 {
        self.issues_by_severity.values().sum()
    }
}

#[async_trait]
pub trait CodeAnalysis: Send + Sync {
    async fn analyze(&self, project_id: Uuid, target: &str) -> Result<AnalysisReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl AgentRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub status: AgentRunStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A remote coding agent that accepts a prompt and runs asynchronously.
#[async_trait]
pub trait AutomationAgent: Send + Sync {
    /// Returns the remote run id.
    async fn submit(&self, prompt: &str, repository: Option<&str>) -> Result<String>;

    async fn status(&self, run_id: &str) -> Result<AgentRun>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRequest {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
    #[serde(default)]
    pub repository: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheck {
    pub name: String,
    pub state: CheckState,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest>;

    async fn comment(&self, pr_number: u64, body: &str) -> Result<()>;

    /// Checks reported for a branch, commit or pull request reference.
    async fn status_checks(&self, reference: &str) -> Result<Vec<StatusCheck>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEnvironment {
    PrPreview,
    Staging,
    Production,
}

impl DeploymentEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrPreview => "pr_preview",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pr_preview" | "pr-preview" | "preview" => Some(Self::PrPreview),
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub project_id: Uuid,
    pub environment: DeploymentEnvironment,
    /// Branch, tag or commit to deploy.
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub environment: DeploymentEnvironment,
    pub url: String,
}

#[async_trait]
pub trait DeploymentService: Send + Sync {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<Deployment>;

    /// Post-deploy probe; `Ok(false)` means reachable but unhealthy.
    async fn check_health(&self, url: &str) -> Result<bool>;

    async fn rollback(&self, deployment_id: &str) -> Result<()>;
}

/// The external services available to step handlers. Any may be absent;
/// a step that needs a missing one fails with `MissingCollaborator`.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub analysis: Option<Arc<dyn CodeAnalysis>>,
    pub agent: Option<Arc<dyn AutomationAgent>>,
    pub source_control: Option<Arc<dyn SourceControl>>,
    pub deployment: Option<Arc<dyn DeploymentService>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analysis(mut self, analysis: Arc<dyn CodeAnalysis>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn AutomationAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_source_control(mut self, source_control: Arc<dyn SourceControl>) -> Self {
        self.source_control = Some(source_control);
        self
    }

    pub fn with_deployment(mut self, deployment: Arc<dyn DeploymentService>) -> Self {
        self.deployment = Some(deployment);
        self
    }

    pub fn analysis(&self) -> Result<&Arc<dyn CodeAnalysis>> {
        self.analysis
            .as_ref()
            .ok_or(OrchestratorError::MissingCollaborator("code analysis"))
    }

    pub fn agent(&self) -> Result<&Arc<dyn AutomationAgent>> {
        self.agent
            .as_ref()
            .ok_or(OrchestratorError::MissingCollaborator("automation agent"))
    }

    pub fn source_control(&self) -> Result<&Arc<dyn SourceControl>> {
        self.source_control
            .as_ref()
            .ok_or(OrchestratorError::MissingCollaborator("source control"))
    }

    pub fn deployment(&self) -> Result<&Arc<dyn DeploymentService>> {
        self.deployment
            .as_ref()
            .ok_or(OrchestratorError::MissingCollaborator("deployment"))
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("analysis", &self.analysis.is_some())
            .field("agent", &self.agent.is_some())
            .field("source_control", &self.source_control.is_some())
            .field("deployment", &self.deployment.is_some())
            .finish()
    }
}
