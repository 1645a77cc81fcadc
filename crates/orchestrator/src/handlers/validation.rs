use serde_json::{json, Map, Value};
use tracing::debug;

use super::{output, HandlerContext, StepOutput};
use crate::collaborators::CheckState;
use crate::error::{OrchestratorError, Result};

/// Evaluate the named `rule`; an unsatisfied rule fails the step.
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let rule = hc.require_str("rule")?;
    debug!(step_id = %hc.step.id, rule = %rule, "Evaluating validation rule");

    match rule.as_str() {
        "quality_threshold" => quality_threshold(hc),
        "deployment_health" => deployment_health(hc).await,
        "status_checks" => status_checks(hc).await,
        "condition" => condition(hc),
        other => Err(OrchestratorError::handler_failed(format!(
            "unknown validation rule '{}'",
            other
        ))),
    }
}

/// Issue counts must stay within `max_critical` (default 0) and the optional
/// `max_major` / `max_total`; `min_quality_score` is checked when given.
/// Reads `report` if configured, else the most recent analysis result.
fn quality_threshold(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let report = match hc.param("report")? {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(OrchestratorError::handler_failed(format!(
                "quality report is not an object: {}",
                other
            )))
        }
        None => latest_analysis(hc).ok_or_else(|| {
            OrchestratorError::PreconditionFailed(
                "quality_threshold needs an analysis result".to_string(),
            )
        })?,
    };

    let count = |severity: &str| {
        report
            .get("issues_by_severity")
            .and_then(|s| s.get(severity))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };
    let total = report
        .get("total_issues")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let mut violations = Vec::new();
    let max_critical = hc.param_f64("max_critical")?.unwrap_or(0.0);
    if count("critical") > max_critical {
        violations.push(format!("{} critical issues (max {})", count("critical"), max_critical));
    }
    if let Some(max_major) = hc.param_f64("max_major")? {
        if count("major") > max_major {
            violations.push(format!("{} major issues (max {})", count("major"), max_major));
        }
    }
    if let Some(max_total) = hc.param_f64("max_total")? {
        if total > max_total {
            violations.push(format!("{} issues in total (max {})", total, max_total));
        }
    }
    if let Some(min_score) = hc.param_f64("min_quality_score")? {
        let score = report.get("quality_score").and_then(Value::as_f64);
        if score.map_or(true, |s| s < min_score) {
            violations.push(format!("quality score {:?} below {}", score, min_score));
        }
    }

    if !violations.is_empty() {
        return Err(OrchestratorError::handler_failed(format!(
            "quality threshold breached: {}",
            violations.join("; ")
        )));
    }
    Ok(output([
        ("rule", json!("quality_threshold")),
        ("passed", json!(true)),
        ("total_issues", json!(total)),
    ]))
}

fn latest_analysis(hc: &HandlerContext<'_>) -> Option<Map<String, Value>> {
    hc.context
        .step_results()
        .filter(|r| r.get("kind") == Some(&Value::from("analysis")))
        .last()
        .cloned()
}

async fn deployment_health(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let url = hc.require_str("url")?;
    let healthy = hc.collaborators.deployment()?.check_health(&url).await?;
    if !healthy {
        return Err(OrchestratorError::handler_failed(format!(
            "deployment at {} is unhealthy",
            url
        )));
    }
    Ok(output([
        ("rule", json!("deployment_health")),
        ("passed", json!(true)),
        ("url", json!(url)),
    ]))
}

/// Every reported check must have succeeded; no checks at all is a failure.
async fn status_checks(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let reference = hc.require_str("reference")?;
    let checks = hc
        .collaborators
        .source_control()?
        .status_checks(&reference)
        .await?;

    if checks.is_empty() {
        return Err(OrchestratorError::handler_failed(format!(
            "no status checks reported for {}",
            reference
        )));
    }

    let not_passing: Vec<String> = checks
        .iter()
        .filter(|c| c.state != CheckState::Success)
        .map(|c| format!("{} ({:?})", c.name, c.state).to_lowercase())
        .collect();
    if !not_passing.is_empty() {
        return Err(OrchestratorError::handler_failed(format!(
            "status checks not passing: {}",
            not_passing.join(", ")
        )));
    }

    Ok(output([
        ("rule", json!("status_checks")),
        ("passed", json!(true)),
        ("checks", json!(checks.len())),
    ]))
}

fn condition(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let condition = hc
        .step
        .config_str("condition")
        .ok_or_else(|| hc.missing("condition"))?;
    if !hc.context.evaluate(condition)? {
        return Err(OrchestratorError::handler_failed(format!(
            "condition not satisfied: {}",
            condition
        )));
    }
    Ok(output([("rule", json!("condition")), ("passed", json!(true))]))
}
