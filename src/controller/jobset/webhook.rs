use kube::api::DynamicObject;
use serde_json::Value;
use tracing::debug;

use super::JobSetAdapter;
use crate::jobframework::webhook::{
    CustomDefaulter, CustomValidator, FieldError, validate_create_for_queue_name,
    validate_update_for_queue_name,
};
use crate::jobframework::{GenericJob, WebhookError, WebhookOptions, WebhookRegistry, queue_name};

pub const MUTATE_PATH: &str = "/mutate-jobset-x-k8s-io-v1alpha2-jobset";
pub const VALIDATE_PATH: &str = "/validate-jobset-x-k8s-io-v1alpha2-jobset";

pub(crate) struct JobSetWebhook {
    manage_jobs_without_queue_name: bool,
}

pub fn setup_jobset_webhook(
    registry: &mut WebhookRegistry,
    options: &WebhookOptions,
) -> Result<(), WebhookError> {
    registry.register_defaulter(
        MUTATE_PATH,
        Box::new(JobSetWebhook {
            manage_jobs_without_queue_name: options.manage_jobs_without_queue_name,
        }),
    )?;
    registry.register_validator(
        VALIDATE_PATH,
        Box::new(JobSetWebhook {
            manage_jobs_without_queue_name: options.manage_jobs_without_queue_name,
        }),
    )
}

impl CustomDefaulter for JobSetWebhook {
    /// New JobSets that go through the queue start suspended.
    fn default(&self, obj: &mut DynamicObject) -> Result<(), WebhookError> {
        let job = JobSetAdapter::try_from(obj.clone())?;
        if !self.manage_jobs_without_queue_name && queue_name(job.meta()).is_none() {
            return Ok(());
        }
        if !job.is_suspended() {
            debug!("Suspending JobSet {:?} on creation", job.meta().name);
            // Edit in place so the patch carries nothing but the flag.
            obj.data["spec"]["suspend"] = Value::Bool(true);
        }
        Ok(())
    }
}

impl CustomValidator for JobSetWebhook {
    fn validate_create(&self, obj: &DynamicObject) -> Result<Vec<FieldError>, WebhookError> {
        let job = JobSetAdapter::try_from(obj.clone())?;
        Ok(validate_create_for_queue_name(job.meta()))
    }

    fn validate_update(
        &self,
        old: &DynamicObject,
        new: &DynamicObject,
    ) -> Result<Vec<FieldError>, WebhookError> {
        let old = JobSetAdapter::try_from(old.clone())?;
        let new = JobSetAdapter::try_from(new.clone())?;
        Ok(validate_update_for_queue_name(
            old.meta(),
            new.meta(),
            new.is_suspended(),
        ))
    }
}
