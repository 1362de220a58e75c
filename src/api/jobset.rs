//! JobSet CRD types (`jobset.x-k8s.io/v1alpha2`).
//!
//! Only the fields the admission integration reads or writes are typed; everything else in the
//! spec is carried through `extra` so a full replace never drops it.

use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::condition::Condition;

pub const JOBSET_COMPLETED: &str = "Completed";
pub const JOBSET_FAILED: &str = "Failed";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "jobset.x-k8s.io",
    version = "v1alpha2",
    kind = "JobSet",
    plural = "jobsets",
    namespaced,
    status = "JobSetStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct JobSetSpec {
    #[serde(default)]
    pub replicated_jobs: Vec<ReplicatedJob>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    /// Network, success/failure policies and anything newer
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedJob {
    pub name: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    pub template: JobTemplateSpec,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_replicas() -> i32 {
    1
}

impl ReplicatedJob {
    pub fn parallelism(&self) -> Option<i32> {
        self.template.spec.as_ref().and_then(|s| s.parallelism)
    }

    pub fn completions(&self) -> Option<i32> {
        self.template.spec.as_ref().and_then(|s| s.completions)
    }

    pub fn pod_spec(&self) -> Option<&PodSpec> {
        self.template.spec.as_ref()?.template.spec.as_ref()
    }

    /// Materializes the job and pod spec levels if the template left them out.
    pub fn pod_spec_mut(&mut self) -> &mut PodSpec {
        self.template
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicated_jobs_status: Vec<ReplicatedJobStatus>,

    #[serde(default)]
    pub restarts: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedJobStatus {
    pub name: String,

    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub succeeded: i32,

    #[serde(default)]
    pub failed: i32,

    #[serde(default)]
    pub active: i32,
}
