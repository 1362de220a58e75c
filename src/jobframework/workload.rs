use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use thiserror::Error;

use super::naming::workload_name_for_owner;
use super::{GenericJob, JobObjectError, PodSetInfo, queue_name};
use crate::api::{Admission, ResourceFlavor, Workload, WorkloadSpec};

#[derive(Error, Debug, PartialEq)]
pub enum AdmissionError {
    #[error("Pod set '{pod_set}' is assigned unknown flavor '{flavor}'")]
    UnknownFlavor { pod_set: String, flavor: String },
}

/// Builds the Workload that represents `job` in the queue.
pub fn construct_workload(
    job: &dyn GenericJob,
    priority: Option<i32>,
) -> Result<Workload, JobObjectError> {
    let meta = job.meta();
    let name = meta.name.as_deref().ok_or(JobObjectError::MissingField("name"))?;
    let uid = meta.uid.as_deref().ok_or(JobObjectError::MissingField("uid"))?;
    let gvk = job.gvk();
    let priority_class = job.priority_class();

    Ok(Workload {
        metadata: ObjectMeta {
            name: Some(workload_name_for_owner(name, &gvk)),
            namespace: meta.namespace.clone(),
            owner_references: Some(vec![OwnerReference {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
                name: name.to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: WorkloadSpec {
            pod_sets: job.pod_sets(),
            queue_name: queue_name(meta).map(str::to_string),
            priority_class_name: (!priority_class.is_empty()).then_some(priority_class),
            priority,
        },
        status: None,
    })
}

/// Node selectors implied by the flavors the queue assigned, index-aligned with the pod sets.
pub fn pod_set_infos_from_admission(
    admission: &Admission,
    flavors: &BTreeMap<String, ResourceFlavor>,
) -> Result<Vec<PodSetInfo>, AdmissionError> {
    admission
        .pod_set_assignments
        .iter()
        .map(|assignment| {
            let mut node_selector = BTreeMap::new();
            for flavor_name in assignment.flavors.values() {
                let flavor =
                    flavors
                        .get(flavor_name)
                        .ok_or_else(|| AdmissionError::UnknownFlavor {
                            pod_set: assignment.name.clone(),
                            flavor: flavor_name.clone(),
                        })?;
                node_selector.extend(flavor.spec.node_labels.clone());
            }
            Ok(PodSetInfo {
                name: assignment.name.clone(),
                node_selector,
            })
        })
        .collect()
}

/// The selectors the job had when its workload was created.
pub fn pod_set_infos_from_workload(workload: &Workload) -> Vec<PodSetInfo> {
    workload
        .spec
        .pod_sets
        .iter()
        .map(|ps| PodSetInfo {
            name: ps.name.clone(),
            node_selector: ps
                .template
                .spec
                .as_ref()
                .and_then(|s| s.node_selector.clone())
                .unwrap_or_default(),
        })
        .collect()
}
