mod raw;
mod timing;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::fs;

use self::raw::RawConfig;
pub use self::raw::ConfigParseError;
use crate::jobframework::{ReconcilerOptions, WebhookOptions};

#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Config {
    pub namespace: Option<String>,
    pub manage_jobs_without_queue_name: bool,
    /// Enabled integrations, in the order they were listed.
    pub frameworks: Vec<String>,
    pub wait_for_pods_ready: bool,
    pub requeue_interval: Duration,
    pub error_backoff: Duration,
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(#[from] ConfigParseError),
}

impl Config {
    pub async fn new_from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigLoadError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigLoadError> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        Ok(Config::try_from(raw)?)
    }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            namespace: self.namespace.clone(),
            manage_jobs_without_queue_name: self.manage_jobs_without_queue_name,
            wait_for_pods_ready: self.wait_for_pods_ready,
            requeue_interval: self.requeue_interval,
            error_backoff: self.error_backoff,
        }
    }

    pub fn webhook_options(&self) -> WebhookOptions {
        WebhookOptions {
            manage_jobs_without_queue_name: self.manage_jobs_without_queue_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_from_file_missing() {
        let err = Config::new_from_file(Path::new("/nonexistent/kueue-jobset.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Io { .. }));
    }

    #[test]
    fn test_options_follow_config() {
        let config = Config::from_yaml(
            r#"
            namespace: team-a
            manageJobsWithoutQueueName: true
            waitForPodsReady:
              enable: true
            "#,
        )
        .unwrap();

        let options = config.reconciler_options();
        assert_eq!(options.namespace.as_deref(), Some("team-a"));
        assert!(options.manage_jobs_without_queue_name);
        assert!(options.wait_for_pods_ready);
        assert!(config.webhook_options().manage_jobs_without_queue_name);
    }

    #[test]
    fn test_from_yaml_invalid() {
        assert!(matches!(
            Config::from_yaml("integrations: { frameworks: [] }"),
            Err(ConfigLoadError::Invalid(ConfigParseError::NoFrameworks))
        ));
        assert!(matches!(
            Config::from_yaml("manageJobsWithoutQueueName: [1]"),
            Err(ConfigLoadError::Yaml(_))
        ));
    }
}
