//! Remediation actions executed by recovery procedures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{IncidentError, Result};

/// The side effects a recovery procedure can request.
///
/// `wait` is not part of this trait; the handler sleeps on its own timer.
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    async fn restart_service(&self, service: &str) -> Result<String>;

    async fn clear_cache(&self, cache: &str) -> Result<String>;

    async fn scale_resources(&self, component: &str, factor: f64) -> Result<String>;

    async fn rollback_deployment(&self, deployment: Option<&str>) -> Result<String>;
}

/// Shell templates for each action. `{target}` and `{factor}` are replaced
/// before the command runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryCommands {
    #[serde(default)]
    pub restart_service: Option<String>,
    #[serde(default)]
    pub clear_cache: Option<String>,
    #[serde(default)]
    pub scale_resources: Option<String>,
    #[serde(default)]
    pub rollback_deployment: Option<String>,
}

impl RecoveryCommands {
    pub fn is_empty(&self) -> bool {
        self.restart_service.is_none()
            && self.clear_cache.is_none()
            && self.scale_resources.is_none()
            && self.rollback_deployment.is_none()
    }
}

/// Runs the configured shell command for each action via `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct CommandRecoveryActions {
    commands: RecoveryCommands,
}

impl CommandRecoveryActions {
    pub fn new(commands: RecoveryCommands) -> Self {
        Self { commands }
    }

    async fn run(&self, action: &str, template: Option<&String>, target: &str, factor: f64) -> Result<String> {
        let template = template.ok_or_else(|| {
            IncidentError::action_failed(action, "no command configured")
        })?;
        let script = template
            .replace("{target}", target)
            .replace("{factor}", &factor.to_string());

        debug!(action, %script, "Running recovery command");

        let output = Command::new("sh").arg("-c").arg(&script).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IncidentError::action_failed(
                action,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RecoveryActions for CommandRecoveryActions {
    async fn restart_service(&self, service: &str) -> Result<String> {
        self.run("restart_service", self.commands.restart_service.as_ref(), service, 1.0)
            .await
    }

    async fn clear_cache(&self, cache: &str) -> Result<String> {
        self.run("clear_cache", self.commands.clear_cache.as_ref(), cache, 1.0)
            .await
    }

    async fn scale_resources(&self, component: &str, factor: f64) -> Result<String> {
        self.run(
            "scale_resources",
            self.commands.scale_resources.as_ref(),
            component,
            factor,
        )
        .await
    }

    async fn rollback_deployment(&self, deployment: Option<&str>) -> Result<String> {
        self.run(
            "rollback_deployment",
            self.commands.rollback_deployment.as_ref(),
            deployment.unwrap_or("latest"),
            1.0,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_action_fails() {
        let actions = CommandRecoveryActions::default();
        let err = actions.restart_service("api").await.unwrap_err();
        assert!(matches!(err, IncidentError::ActionFailed { .. }));
        assert!(err.to_string().contains("no command configured"));
    }

    #[tokio::test]
    async fn test_placeholders_substituted() {
        let actions = CommandRecoveryActions::new(RecoveryCommands {
            scale_resources: Some("echo scaling {target} by {factor}".to_string()),
            ..Default::default()
        });
        let out = actions.scale_resources("worker", 1.5).await.unwrap();
        assert_eq!(out, "scaling worker by 1.5");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let actions = CommandRecoveryActions::new(RecoveryCommands {
            clear_cache: Some("echo nope >&2; exit 3".to_string()),
            ..Default::default()
        });
        let err = actions.clear_cache("redis").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_commands_deserialize_partially() {
        let commands: RecoveryCommands =
            serde_json::from_str(r#"{"restart_service": "systemctl restart {target}"}"#).unwrap();
        assert!(!commands.is_empty());
        assert!(commands.clear_cache.is_none());
        assert!(RecoveryCommands::default().is_empty());
    }
}
