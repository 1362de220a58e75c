use std::collections::BTreeSet;

use serde::Deserialize;
use thiserror::Error;

use super::Config;
use super::timing::TimingConfig;
use crate::controller::jobset;

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawConfig {
    /// Namespace to watch. All namespaces when omitted.
    #[serde(default)]
    pub(super) namespace: Option<String>,

    #[serde(default)]
    pub(super) manage_jobs_without_queue_name: bool,

    #[serde(default)]
    pub(super) integrations: Option<RawIntegrations>,

    #[serde(default)]
    pub(super) wait_for_pods_ready: RawWaitForPodsReady,

    #[serde(flatten)]
    pub(super) timing: TimingConfig,
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone)]
pub(super) struct RawIntegrations {
    /// Framework names, e.g. "jobset.x-k8s.io/jobset"
    pub(super) frameworks: Vec<String>,
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct RawWaitForPodsReady {
    #[serde(default)]
    pub(super) enable: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigParseError {
    #[error("integrations.frameworks must list at least one framework")]
    NoFrameworks,

    #[error("Framework '{name}' is listed more than once")]
    DuplicateFramework { name: String },

    #[error("Namespace must not be empty")]
    EmptyNamespace,

    #[error("'{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigParseError;
    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        if raw.namespace.as_deref() == Some("") {
            return Err(ConfigParseError::EmptyNamespace);
        }

        let frameworks = match raw.integrations {
            Some(integrations) => integrations.frameworks,
            None => vec![jobset::FRAMEWORK_NAME.to_string()],
        };
        if frameworks.is_empty() {
            return Err(ConfigParseError::NoFrameworks);
        }
        let mut seen = BTreeSet::new();
        for name in &frameworks {
            if !seen.insert(name.as_str()) {
                return Err(ConfigParseError::DuplicateFramework { name: name.clone() });
            }
        }

        if raw.timing.requeue_interval.is_zero() {
            return Err(ConfigParseError::ZeroDuration {
                field: "requeueInterval",
            });
        }
        if raw.timing.error_backoff.is_zero() {
            return Err(ConfigParseError::ZeroDuration {
                field: "errorBackoff",
            });
        }

        Ok(Config {
            namespace: raw.namespace,
            manage_jobs_without_queue_name: raw.manage_jobs_without_queue_name,
            frameworks,
            wait_for_pods_ready: raw.wait_for_pods_ready.enable,
            requeue_interval: raw.timing.requeue_interval,
            error_backoff: raw.timing.error_backoff,
        })
    }
}
