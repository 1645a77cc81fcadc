use serde_json::json;
use tracing::info;

use super::{output, HandlerContext, StepOutput};
use crate::collaborators::PullRequestRequest;
use crate::error::Result;

/// Open a pull request with templated title, body and branches.
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let request = PullRequestRequest {
        title: hc.require_str("title")?,
        body: hc.param_str("body")?.unwrap_or_default(),
        head_branch: hc.require_str("head_branch")?,
        base_branch: hc
            .param_str("base_branch")?
            .unwrap_or_else(|| "main".to_string()),
        repository: hc.param_str("repository")?,
    };

    let pr = hc
        .collaborators
        .source_control()?
        .create_pull_request(&request)
        .await?;

    info!(step_id = %hc.step.id, pr_number = pr.number, url = %pr.url, "Pull request created");

    Ok(output([
        ("pr_number", json!(pr.number)),
        ("pr_url", json!(pr.url)),
        ("head_branch", json!(request.head_branch)),
        ("base_branch", json!(request.base_branch)),
    ]))
}
