use serde_json::json;
use tracing::debug;

use events::Event;

use super::{output, HandlerContext, StepOutput};
use crate::error::{OrchestratorError, Result};

const DEFAULT_CHANNEL: &str = "event_bus";

/// Deliver the rendered `message` to each entry of `channels`.
///
/// `event_bus` publishes a notification event; `pr_comment` comments on
/// `pr_number` through source control.
pub async fn run(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let message = hc.require_str("message")?;
    let channels = hc
        .param_list("channels")?
        .unwrap_or_else(|| vec![DEFAULT_CHANNEL.to_string()]);

    let mut delivered = Vec::with_capacity(channels.len());
    for channel in channels {
        match channel.as_str() {
            "event_bus" => {
                if let Some(sink) = hc.event_sink {
                    sink.emit(Event::Notification {
                        target_id: Some(hc.workflow_id),
                        channel: channel.clone(),
                        message: message.clone(),
                    });
                }
            }
            "pr_comment" => {
                let pr_number = hc
                    .param_f64("pr_number")?
                    .ok_or_else(|| hc.missing("pr_number"))?;
                hc.collaborators
                    .source_control()?
                    .comment(pr_number as u64, &message)
                    .await?;
            }
            other => {
                return Err(OrchestratorError::handler_failed(format!(
                    "unknown notification channel '{}'",
                    other
                )))
            }
        }
        debug!(step_id = %hc.step.id, channel = %channel, "Notification delivered");
        delivered.push(channel);
    }

    Ok(output([
        ("delivered", json!(delivered)),
        ("message", json!(message)),
    ]))
}
