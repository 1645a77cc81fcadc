use serde_json::json;

use super::{output, HandlerContext, StepOutput};
use crate::error::Result;

/// Evaluate `condition` and report which branch applies. The graph itself is
/// not altered; downstream steps read `satisfied` through `run_if`.
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let condition = hc
        .step
        .config_str("condition")
        .ok_or_else(|| hc.missing("condition"))?;
    let satisfied = hc.context.evaluate(condition)?;

    Ok(output([
        ("condition", json!(condition)),
        ("satisfied", json!(satisfied)),
        ("branch", json!(if satisfied { "satisfied" } else { "skipped" })),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;
    use flowpilot_core::StepType;

    #[tokio::test]
    async fn test_branches() {
        let fixture = Fixture::new(
            StepType::Conditional,
            json!({"condition": "steps.analyze.total_issues < 5 && steps.analyze.ok"}),
        )
        .with_result("analyze", json!({"total_issues": 2, "ok": true}));
        let result = run(&fixture.handler_context()).await.unwrap();
        assert_eq!(result["satisfied"], json!(true));
        assert_eq!(result["branch"], json!("satisfied"));

        let fixture = Fixture::new(StepType::Conditional, json!({"condition": "!workflow.name"}));
        let result = run(&fixture.handler_context()).await.unwrap();
        assert_eq!(result["branch"], json!("skipped"));
    }

    #[tokio::test]
    async fn test_malformed_condition_fails() {
        let fixture = Fixture::new(StepType::Conditional, json!({"condition": "a == "}));
        assert!(run(&fixture.handler_context()).await.is_err());
    }
}
