use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    Syntax,
    Runtime,
    ResourceExhaustion,
    Security,
    Configuration,
    IntegrationFailure,
    Performance,
    Data,
    Dependency,
    #[default]
    Unknown,
}

impl ErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Security => "security",
            Self::Configuration => "configuration",
            Self::IntegrationFailure => "integration_failure",
            Self::Performance => "performance",
            Self::Data => "data",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    #[default]
    Detected,
    Investigating,
    Resolving,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Investigating => "investigating",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Resolved | Self::Closed)
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of an incident's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionStep {
    pub action: String,
    pub procedure: Option<String>,
    pub success: bool,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub incident_type: String,
    pub message: String,
    pub error_classification: ErrorClassification,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub root_cause: Option<String>,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub resolution_steps: Vec<ResolutionStep>,
    pub manual_intervention_required: bool,
    pub effectiveness_score: Option<f64>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn new(incident_type: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_type: incident_type.into(),
            message: message.into(),
            error_classification: ErrorClassification::default(),
            severity,
            status: IncidentStatus::default(),
            root_cause: None,
            affected_components: Vec::new(),
            context: Map::new(),
            resolution_steps: Vec::new(),
            manual_intervention_required: false,
            effectiveness_score: None,
            detected_at: Utc::now(),
            resolved_at: None,
            closed_at: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.affected_components = components;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Message and type concatenated, lowercased; the text procedures match against.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.incident_type, self.message).to_lowercase()
    }

    pub fn record_step(
        &mut self,
        action: impl Into<String>,
        procedure: Option<&str>,
        success: bool,
        detail: Option<String>,
    ) {
        self.resolution_steps.push(ResolutionStep {
            action: action.into(),
            procedure: procedure.map(str::to_string),
            success,
            detail,
            recorded_at: Utc::now(),
        });
    }
}
