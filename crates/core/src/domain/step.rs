use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::error::CoreError;

/// Opaque key/value configuration interpreted by a step's handler.
pub type StepConfig = Map<String, Value>;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Analysis,
    AgentExecution,
    /// Opens a pull request on the source-control collaborator
    #[serde(rename = "create_pr")]
    PullRequest,
    Deployment,
    Validation,
    Notification,
    Conditional,
    ParallelGroup,
    Command,
    Script,
}

impl StepType {
    pub const ALL: [StepType; 10] = [
        Self::Analysis,
        Self::AgentExecution,
        Self::PullRequest,
        Self::Deployment,
        Self::Validation,
        Self::Notification,
        Self::Conditional,
        Self::ParallelGroup,
        Self::Command,
        Self::Script,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::AgentExecution => "agent_execution",
            Self::PullRequest => "create_pr",
            Self::Deployment => "deployment",
            Self::Validation => "validation",
            Self::Notification => "notification",
            Self::Conditional => "conditional",
            Self::ParallelGroup => "parallel_group",
            Self::Command => "command",
            Self::Script => "script",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::str::FromStr for StepType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::unknown("step type", s))
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    /// Completed or skipped: counts towards workflow progress.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(default)]
    pub config: StepConfig,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Map<String, Value>>,
    pub error: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            step_type,
            status: StepStatus::default(),
            config: StepConfig::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a single config entry.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Key under which this step's result is published to the execution context.
    pub fn context_key(&self) -> String {
        format!("step_{}_result", self.id)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.error = None;
    }

    /// Count a retry and return the new retry count.
    pub fn begin_retry(&mut self, error: impl Into<String>) -> u32 {
        self.retry_count += 1;
        self.status = StepStatus::Retrying;
        self.error = Some(error.into());
        self.retry_count
    }

    pub fn complete(&mut self, result: Map<String, Value>) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        let mut result = Map::new();
        result.insert("skipped".to_string(), Value::Bool(true));
        result.insert("reason".to_string(), Value::String(reason.into()));
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }
}

/// Input shape used by workflow intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: None,
            name: name.into(),
            step_type,
            config: StepConfig::new(),
            max_retries: None,
            timeout_secs: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Build a pending step, filling unset limits from the given defaults.
    pub fn into_step(self, default_max_retries: u32, default_timeout_secs: u64) -> Step {
        Step::new(self.name, self.step_type)
            .with_id(self.id.unwrap_or_else(Uuid::new_v4))
            .with_config(self.config)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries))
            .with_timeout_secs(self.timeout_secs.unwrap_or(default_timeout_secs))
    }
}
