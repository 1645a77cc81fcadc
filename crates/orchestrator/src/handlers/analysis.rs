use serde_json::{json, Value};
use tracing::debug;

use super::{output, HandlerContext, StepOutput};
use crate::error::Result;

/// Run the code-analysis collaborator over `target` (default `.`).
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let target = hc.param_str("target")?.unwrap_or_else(|| ".".to_string());
    let report = hc
        .collaborators
        .analysis()?
        .analyze(hc.project_id, &target)
        .await?;

    debug!(
        step_id = %hc.step.id,
        total_issues = report.total_issues(),
        "Analysis finished"
    );

    Ok(output([
        ("kind", json!("analysis")),
        ("target", json!(target)),
        ("issues_by_severity", json!(report.issues_by_severity)),
        ("issues_by_type", json!(report.issues_by_type)),
        ("total_issues", json!(report.total_issues())),
        (
            "quality_score",
            report.quality_score.map(Value::from).unwrap_or(Value::Null),
        ),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AnalysisReport, CodeAnalysis};
    use crate::error::OrchestratorError;
    use crate::handlers::test_support::Fixture;
    use async_trait::async_trait;
    use flowpilot_core::StepType;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    struct TwoMajors;

    #[async_trait]
    impl CodeAnalysis for TwoMajors {
        async fn analyze(&self, _project_id: Uuid, target: &str) -> Result<AnalysisReport> {
            assert_eq!(target, "src");
            Ok(AnalysisReport {
                issues_by_severity: BTreeMap::from([
                    ("critical".to_string(), 0),
                    ("major".to_string(), 2),
                ]),
                issues_by_type: BTreeMap::from([("lint".to_string(), 2)]),
                quality_score: Some(87.5),
            })
        }
    }

    #[tokio::test]
    async fn test_reports_issue_counts() {
        let mut fixture = Fixture::new(StepType::Analysis, json!({"target": "src"}));
        fixture.collaborators = fixture.collaborators.clone().with_analysis(Arc::new(TwoMajors));

        let result = run(&fixture.handler_context()).await.unwrap();
        assert_eq!(result["total_issues"], json!(2));
        assert_eq!(result["issues_by_severity"]["major"], json!(2));
        assert_eq!(result["quality_score"], json!(87.5));
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_an_error() {
        let fixture = Fixture::new(StepType::Analysis, json!({}));
        let err = run(&fixture.handler_context()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingCollaborator(_)));
    }
}
