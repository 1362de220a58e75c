use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use thiserror::Error;
use tracing::info;

use super::index::{FieldIndexer, IndexError};
use super::reconciler::{JobReconciler, ReconcilerContext};
use super::scheme::{Scheme, SchemeError};
use super::webhook::{WebhookError, WebhookOptions, WebhookRegistry};
use super::{GenericJob, JobObjectError};

pub type NewJobFn = fn(DynamicObject) -> Result<Box<dyn GenericJob>, JobObjectError>;
pub type SetupIndexesFn = fn(&mut dyn FieldIndexer) -> Result<(), IndexError>;
pub type NewReconcilerFn = fn(ReconcilerContext) -> Box<dyn JobReconciler>;
pub type SetupWebhookFn = fn(&mut WebhookRegistry, &WebhookOptions) -> Result<(), WebhookError>;
pub type JobTypeFn = fn() -> ApiResource;
pub type AddToSchemeFn = fn(&mut Scheme) -> Result<(), SchemeError>;
pub type OwnerPredicateFn = fn(&OwnerReference) -> bool;

/// Everything the framework needs to drive one resource kind.
#[derive(Clone, Copy)]
pub struct IntegrationCallbacks {
    pub new_job: NewJobFn,
    pub setup_indexes: SetupIndexesFn,
    pub new_reconciler: NewReconcilerFn,
    pub setup_webhook: SetupWebhookFn,
    pub job_type: JobTypeFn,
    pub add_to_scheme: AddToSchemeFn,
    pub is_managing_objects_owner: OwnerPredicateFn,
}

impl IntegrationCallbacks {
    pub fn gvk(&self) -> GroupVersionKind {
        let ar = (self.job_type)();
        GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Integration '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Integration name must not be empty")]
    EmptyName,

    #[error("Integration '{0}' is not registered")]
    NotFound(String),
}

/// Startup-time registry. Turned into read-only [`Integrations`] with [`IntegrationRegistry::freeze`].
#[derive(Default)]
pub struct IntegrationRegistry {
    entries: Vec<(String, IntegrationCallbacks)>,
}

impl IntegrationRegistry {
    pub fn register(
        &mut self,
        name: &str,
        callbacks: IntegrationCallbacks,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        info!("Registered integration '{}'", name);
        self.entries.push((name.to_string(), callbacks));
        Ok(())
    }

    pub fn freeze(self) -> Integrations {
        Integrations {
            entries: Arc::new(self.entries),
        }
    }
}

/// Frozen registry, in registration order. Cheap to clone.
#[derive(Clone)]
pub struct Integrations {
    entries: Arc<Vec<(String, IntegrationCallbacks)>>,
}

impl Integrations {
    pub fn get(&self, name: &str) -> Option<&IntegrationCallbacks> {
        self.entries
            .iter()
            .find_map(|(n, cb)| (n == name).then_some(cb))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IntegrationCallbacks)> {
        self.entries.iter().map(|(n, cb)| (n.as_str(), cb))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Resolves the configured framework names, failing on the first unknown one.
    pub fn select<'a>(
        &'a self,
        names: &[String],
    ) -> Result<Vec<(&'a str, &'a IntegrationCallbacks)>, RegistryError> {
        names
            .iter()
            .map(|name| {
                self.entries
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(n, cb)| (n.as_str(), cb))
                    .ok_or_else(|| RegistryError::NotFound(name.clone()))
            })
            .collect()
    }

    pub fn find_by_gvk(&self, gvk: &GroupVersionKind) -> Option<(&str, &IntegrationCallbacks)> {
        self.iter().find(|(_, cb)| &cb.gvk() == gvk)
    }

    /// Whether `owner` is an object some registered integration already manages.
    pub fn is_managing_objects_owner(&self, owner: &OwnerReference) -> bool {
        self.entries
            .iter()
            .any(|(_, cb)| (cb.is_managing_objects_owner)(owner))
    }
}

impl fmt::Debug for Integrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
