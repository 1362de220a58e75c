//! Generic "admittable job" framework.
//!
//! Every supported resource kind implements [`GenericJob`] and registers an
//! [`IntegrationCallbacks`] bundle; the reconciler, indexes and webhooks only ever talk to
//! those two seams.

pub mod equality;
pub mod index;
pub mod maps;
pub mod naming;
pub mod reconciler;
pub mod registry;
pub mod scheme;
pub mod webhook;
pub mod workload;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DynamicObject, GroupVersionKind};
use thiserror::Error;

use crate::api::{Condition, PodSet, Workload};

pub use index::{FieldIndexer, IndexError, WorkloadIndex, setup_workload_owner_index};
pub use reconciler::{JobReconciler, ReconcilerContext, ReconcilerOptions};
pub use registry::{IntegrationCallbacks, IntegrationRegistry, Integrations, RegistryError};
pub use scheme::{Scheme, SchemeError};
pub use webhook::{WebhookError, WebhookOptions, WebhookRegistry};

pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";
pub const QUEUE_NAME_ANNOTATION: &str = "kueue.x-k8s.io/queue-name";
pub const MANAGER_NAME: &str = "kueue-jobset";

/// Scheduling overlay for one pod set, index-aligned with [`GenericJob::pod_sets`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSetInfo {
    pub name: String,
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum PodSetInfoError {
    #[error("expected {expected} pod set infos, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum JobObjectError {
    #[error("Failed to convert object: {0}")]
    Conversion(#[from] serde_json::Error),

    #[error("Object has no {0}")]
    MissingField(&'static str),
}

pub trait GenericJob: Send + Sync {
    /// The resource as kube's generic handle, ready to be replaced by the caller.
    fn object(&self) -> Result<DynamicObject, JobObjectError>;

    fn meta(&self) -> &ObjectMeta;

    fn gvk(&self) -> GroupVersionKind;

    fn is_suspended(&self) -> bool;

    /// Approximation: negation of [`GenericJob::is_suspended`], live counts are not consulted.
    fn is_active(&self) -> bool;

    fn suspend(&mut self);

    /// Whether the status had to be cleared before the job can be suspended again.
    fn reset_status(&mut self) -> bool;

    fn pod_sets(&self) -> Vec<PodSet>;

    /// Resumes the job and injects `infos` into its pod templates.
    ///
    /// An empty `infos` only resumes. Otherwise the length must match the pod set count and
    /// nothing is touched when it does not.
    fn run_with_pod_sets_info(&mut self, infos: &[PodSetInfo]) -> Result<(), PodSetInfoError>;

    /// Puts the pod templates back to `infos`. Returns whether anything changed.
    fn restore_pod_sets_info(&mut self, infos: &[PodSetInfo]) -> Result<bool, PodSetInfoError>;

    /// The `Finished` condition for the workload once the job reached a terminal state.
    fn finished(&self) -> Option<Condition>;

    fn equivalent_to_workload(&self, workload: &Workload) -> bool;

    fn priority_class(&self) -> String;

    fn pods_ready(&self) -> bool;
}

pub fn queue_name(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(QUEUE_NAME_LABEL))
        .or_else(|| {
            meta.annotations
                .as_ref()
                .and_then(|a| a.get(QUEUE_NAME_ANNOTATION))
        })
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}
