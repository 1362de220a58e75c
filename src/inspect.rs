//! Offline view of a manifest through its integration.

use kube::api::DynamicObject;
use kube::core::GroupVersion;
use serde::Serialize;
use thiserror::Error;

use crate::api::Condition;
use crate::jobframework::naming::workload_name_for_owner;
use crate::jobframework::{Integrations, JobObjectError, Scheme, queue_name};

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Failed to parse manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Manifest has no apiVersion or kind")]
    MissingTypeMeta,

    #[error("Invalid apiVersion '{0}'")]
    InvalidApiVersion(String),

    #[error("Kind '{0}' is not served by any enabled integration")]
    UnknownKind(String),

    #[error(transparent)]
    Object(#[from] JobObjectError),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PodSetSummary {
    pub name: String,
    pub count: i32,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub integration: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub queue_name: Option<String>,
    pub workload_name: Option<String>,
    pub suspended: bool,
    pub pod_sets: Vec<PodSetSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<Condition>,
    pub pods_ready: bool,
}

pub fn inspect_manifest(
    manifest: &str,
    scheme: &Scheme,
    integrations: &Integrations,
) -> Result<JobSummary, InspectError> {
    let obj: DynamicObject = serde_yaml::from_str(manifest)?;
    let types = obj.types.as_ref().ok_or(InspectError::MissingTypeMeta)?;
    let gvk = types
        .api_version
        .parse::<GroupVersion>()
        .map_err(|_| InspectError::InvalidApiVersion(types.api_version.clone()))?
        .with_kind(&types.kind);

    if !scheme.recognizes(&gvk) {
        return Err(InspectError::UnknownKind(types.kind.clone()));
    }
    let (integration, callbacks) = integrations
        .find_by_gvk(&gvk)
        .ok_or_else(|| InspectError::UnknownKind(types.kind.clone()))?;

    let job = (callbacks.new_job)(obj)?;
    let meta = job.meta();
    let priority_class = job.priority_class();

    Ok(JobSummary {
        integration: integration.to_string(),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        queue_name: queue_name(meta).map(str::to_string),
        workload_name: meta
            .name
            .as_deref()
            .map(|name| workload_name_for_owner(name, &job.gvk())),
        suspended: job.is_suspended(),
        pod_sets: job
            .pod_sets()
            .into_iter()
            .map(|ps| PodSetSummary {
                name: ps.name,
                count: ps.count,
            })
            .collect(),
        priority_class: (!priority_class.is_empty()).then_some(priority_class),
        finished: job.finished(),
        pods_ready: job.pods_ready(),
    })
}
