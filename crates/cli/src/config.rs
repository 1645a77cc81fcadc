use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use incidents::{MonitorConfig, RecoveryCommands};
use orchestrator::EngineConfig;

pub const FLOWPILOT_DIR: &str = ".flowpilot";
pub const CONFIG_FILE: &str = "config.toml";

/// Contents of `.flowpilot/config.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowpilotConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub recovery: RecoveryCommands,
}

impl FlowpilotConfig {
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(FLOWPILOT_DIR).join(CONFIG_FILE)
    }

    /// Read the config at `path`. A missing or unparsable file yields the
    /// defaults with a warning.
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "Using default configuration");
                Self::default()
            }
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_written_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = FlowpilotConfig::default_path(dir.path());

        FlowpilotConfig::default().write(&path).await.unwrap();
        let loaded = FlowpilotConfig::load(&path).await.unwrap();

        assert_eq!(loaded.engine.backoff_cap_units, 60);
        assert_eq!(loaded.monitor.interval(), Duration::from_secs(30));
        assert_eq!(loaded.monitor.metrics.len(), 4);
        assert!(loaded.recovery.is_empty());
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            "[engine]\nparallel_group_limit = 2\n\n[recovery]\nrestart_service = \"systemctl restart {target}\"\n",
        )
        .await
        .unwrap();

        let config = FlowpilotConfig::load(&path).await.unwrap();
        assert_eq!(config.engine.parallel_group_limit, 2);
        assert_eq!(config.engine.default_max_retries, 3);
        assert_eq!(
            config.recovery.restart_service.as_deref(),
            Some("systemctl restart {target}")
        );
    }

    #[tokio::test]
    async fn test_missing_or_broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert_eq!(
            FlowpilotConfig::load_or_default(&missing).await.engine.retention_secs,
            3600
        );

        let broken = dir.path().join("broken.toml");
        tokio::fs::write(&broken, "[engine\n").await.unwrap();
        assert!(FlowpilotConfig::load(&broken).await.is_err());
        assert_eq!(
            FlowpilotConfig::load_or_default(&broken).await.monitor.metrics.len(),
            4
        );
    }
}
