use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{output, HandlerContext, StepOutput};
use crate::collaborators::{DeploymentEnvironment, DeploymentRequest};
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};

/// Deploy `reference` to `environment`.
///
/// Production requires a healthy staging deployment earlier in the same
/// workflow and is rolled back when its post-deploy health check fails.
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let environment_name = hc.require_str("environment")?;
    let environment = DeploymentEnvironment::parse(&environment_name).ok_or_else(|| {
        OrchestratorError::handler_failed(format!("unknown environment '{}'", environment_name))
    })?;
    let reference = hc
        .param_str("reference")?
        .unwrap_or_else(|| "main".to_string());
    let production = environment == DeploymentEnvironment::Production;
    let validate = hc.param_bool("validate")?.unwrap_or(production);

    if production && !has_healthy_staging(hc.context) {
        return Err(OrchestratorError::PreconditionFailed(
            "production deployment requires a successful staging deployment".to_string(),
        ));
    }

    let service = hc.collaborators.deployment()?;
    let deployment = service
        .deploy(&DeploymentRequest {
            project_id: hc.project_id,
            environment,
            reference: reference.clone(),
        })
        .await?;

    info!(
        step_id = %hc.step.id,
        environment = environment.as_str(),
        deployment_id = %deployment.id,
        url = %deployment.url,
        "Deployment created"
    );

    let healthy = if validate {
        match service.check_health(&deployment.url).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(deployment_id = %deployment.id, error = %e, "Health check errored");
                false
            }
        }
    } else {
        true
    };

    if !healthy {
        if production {
            error!(deployment_id = %deployment.id, "Production validation failed, rolling back");
            service.rollback(&deployment.id).await?;
            return Err(OrchestratorError::handler_failed(format!(
                "production deployment {} failed validation and was rolled back",
                deployment.id
            )));
        }
        return Err(OrchestratorError::handler_failed(format!(
            "{} deployment {} failed validation",
            environment.as_str(),
            deployment.id
        )));
    }

    Ok(output([
        ("kind", json!("deployment")),
        ("environment", json!(environment.as_str())),
        ("deployment_id", json!(deployment.id)),
        ("url", json!(deployment.url)),
        ("reference", json!(reference)),
        ("validated", json!(validate)),
        ("healthy", json!(healthy)),
    ]))
}

fn has_healthy_staging(context: &ExecutionContext) -> bool {
    context.step_results().any(|result| {
        result.get("kind") == Some(&Value::from("deployment"))
            && result.get("environment") == Some(&Value::from("staging"))
            && result.get("healthy") != Some(&Value::Bool(false))
    })
}
