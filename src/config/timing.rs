use std::time::Duration;

use duration_string::DurationString;
use serde::{Deserialize, Deserializer};

pub(super) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationString::deserialize(deserializer).map(Duration::from)
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimingConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_requeue_interval"
    )]
    pub(crate) requeue_interval: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_backoff"
    )]
    pub(crate) error_backoff: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            requeue_interval: default_requeue_interval(),
            error_backoff: default_error_backoff(),
        }
    }
}

const fn default_requeue_interval() -> Duration {
    Duration::from_secs(300)
}
const fn default_error_backoff() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Debug, PartialEq)]
    struct A {
        #[serde(flatten)]
        timing: TimingConfig,
    }

    #[test]
    fn test_timing_config_deserialize_partial() {
        let yaml_data = r#"
          errorBackoff: 30s
        "#;

        let a: A = serde_yaml::from_str(yaml_data).unwrap();

        assert_eq!(
            a.timing,
            TimingConfig {
                requeue_interval: Duration::from_secs(300),
                error_backoff: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn test_timing_config_deserialize_omitted() {
        let a: A = serde_yaml::from_str("{}").unwrap();
        assert_eq!(a.timing, TimingConfig::default());
    }

    #[test]
    fn test_timing_config_rejects_garbage() {
        assert!(serde_yaml::from_str::<A>("requeueInterval: soon").is_err());
    }
}
