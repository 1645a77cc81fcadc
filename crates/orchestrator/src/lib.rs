//! Workflow orchestration.
//!
//! A [`WorkflowEngine`] owns a [`WorkflowStore`] and drives each running
//! workflow in batches: the [`DependencyResolver`] picks the ready steps, the
//! [`StepExecutor`] runs them concurrently with timeout and retry, and their
//! results land in the workflow's [`ExecutionContext`] for later steps to
//! read through `${..}` placeholders and `run_if` conditions.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod handlers;
pub mod metrics;
pub mod resolver;
pub mod state_machine;
pub mod store;

pub use collaborators::{
    AgentRun, AgentRunStatus, AnalysisReport, AutomationAgent, CheckState, CodeAnalysis,
    Collaborators, Deployment, DeploymentEnvironment, DeploymentRequest, DeploymentService,
    PullRequest, PullRequestRequest, SourceControl, StatusCheck,
};
pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use engine::{WorkflowDefinition, WorkflowEngine};
pub use error::{OrchestratorError, Result};
pub use executor::{StepExecutor, StepScope};
pub use handlers::StepOutput;
pub use metrics::EngineMetrics;
pub use resolver::DependencyResolver;
pub use state_machine::{StepStateMachine, WorkflowStateMachine};
pub use store::WorkflowStore;
