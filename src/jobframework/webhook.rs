//! Admission hooks shared by all integrations.
//!
//! Integrations register a defaulter and a validator per path; serving them over HTTPS is left
//! to whatever fronts the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{JobObjectError, QUEUE_NAME_LABEL, queue_name};

const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;

static DNS1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS-1123 subdomain pattern is valid")
});

#[derive(Debug, Clone, Default)]
pub struct WebhookOptions {
    pub manage_jobs_without_queue_name: bool,
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook path '{0}' is already registered")]
    DuplicatePath(String),

    #[error("No webhook registered for path '{0}'")]
    UnknownPath(String),

    #[error("Admission request carries no object")]
    MissingObject,

    #[error("Invalid object: {0}")]
    Object(#[from] JobObjectError),
}

/// A single validation failure, rendered as `path: message`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub trait CustomDefaulter: Send + Sync {
    fn default(&self, obj: &mut DynamicObject) -> Result<(), WebhookError>;
}

pub trait CustomValidator: Send + Sync {
    fn validate_create(&self, obj: &DynamicObject) -> Result<Vec<FieldError>, WebhookError>;

    fn validate_update(
        &self,
        old: &DynamicObject,
        new: &DynamicObject,
    ) -> Result<Vec<FieldError>, WebhookError>;
}

#[derive(Default)]
pub struct WebhookRegistry {
    defaulters: BTreeMap<String, Box<dyn CustomDefaulter>>,
    validators: BTreeMap<String, Box<dyn CustomValidator>>,
}

impl WebhookRegistry {
    pub fn register_defaulter(
        &mut self,
        path: &str,
        defaulter: Box<dyn CustomDefaulter>,
    ) -> Result<(), WebhookError> {
        if self.defaulters.contains_key(path) {
            return Err(WebhookError::DuplicatePath(path.to_string()));
        }
        self.defaulters.insert(path.to_string(), defaulter);
        Ok(())
    }

    pub fn register_validator(
        &mut self,
        path: &str,
        validator: Box<dyn CustomValidator>,
    ) -> Result<(), WebhookError> {
        if self.validators.contains_key(path) {
            return Err(WebhookError::DuplicatePath(path.to_string()));
        }
        self.validators.insert(path.to_string(), validator);
        Ok(())
    }

    pub fn paths(&self) -> Vec<&str> {
        self.defaulters
            .keys()
            .chain(self.validators.keys())
            .map(String::as_str)
            .collect()
    }

    /// Runs the defaulter for `path` and returns the resulting JSON patch.
    pub fn mutate_object(
        &self,
        path: &str,
        obj: &DynamicObject,
    ) -> Result<json_patch::Patch, WebhookError> {
        let defaulter = self
            .defaulters
            .get(path)
            .ok_or_else(|| WebhookError::UnknownPath(path.to_string()))?;
        let mut mutated = obj.clone();
        defaulter.default(&mut mutated)?;
        let before = serde_json::to_value(obj).map_err(JobObjectError::from)?;
        let after = serde_json::to_value(&mutated).map_err(JobObjectError::from)?;
        Ok(json_patch::diff(&before, &after))
    }

    pub fn validate_object(
        &self,
        path: &str,
        operation: &Operation,
        obj: &DynamicObject,
        old: Option<&DynamicObject>,
    ) -> Result<Vec<FieldError>, WebhookError> {
        let validator = self
            .validators
            .get(path)
            .ok_or_else(|| WebhookError::UnknownPath(path.to_string()))?;
        match (operation, old) {
            (Operation::Update, Some(old)) => validator.validate_update(old, obj),
            (Operation::Create, _) => validator.validate_create(obj),
            _ => Ok(vec![]),
        }
    }

    /// Answers one admission request for the webhook registered at `path`.
    ///
    /// Serving HTTPS is left to the front end that terminates TLS and routes by path.
    /// Mutating paths only patch on CREATE. Requests without an object are allowed unchanged.
    pub fn review(&self, path: &str, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let response = AdmissionResponse::from(req);
        let Some(obj) = req.object.as_ref() else {
            debug!(uid = %req.uid, "No object in admission request, allowing unchanged");
            return response;
        };

        if self.defaulters.contains_key(path) {
            if req.operation != Operation::Create {
                return response;
            }
            return match self.mutate_object(path, obj) {
                Ok(patch) if patch.0.is_empty() => response,
                Ok(patch) => {
                    info!(uid = %req.uid, path, ops = patch.0.len(), "Defaulting object");
                    match response.with_patch(patch) {
                        Ok(patched) => patched,
                        Err(e) => AdmissionResponse::from(req)
                            .deny(format!("patch serialization error: {e}")),
                    }
                }
                Err(e) => {
                    warn!(uid = %req.uid, path, error = %e, "Defaulting failed");
                    response.deny(e.to_string())
                }
            };
        }

        match self.validate_object(path, &req.operation, obj, req.old_object.as_ref()) {
            Ok(errors) if errors.is_empty() => response,
            Ok(errors) => response.deny(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Err(e) => response.deny(e.to_string()),
        }
    }
}

pub fn queue_name_label_path() -> String {
    format!("metadata.labels[{QUEUE_NAME_LABEL}]")
}

pub fn validate_create_for_queue_name(meta: &ObjectMeta) -> Vec<FieldError> {
    let Some(name) = queue_name(meta) else {
        return vec![];
    };
    if name.len() > DNS1123_SUBDOMAIN_MAX_LENGTH || !DNS1123_SUBDOMAIN.is_match(name) {
        return vec![FieldError::new(
            queue_name_label_path(),
            format!("invalid value '{name}': must be a lowercase RFC 1123 subdomain"),
        )];
    }
    vec![]
}

/// The queue name cannot change while the job is allowed to run.
pub fn validate_update_for_queue_name(
    old: &ObjectMeta,
    new: &ObjectMeta,
    new_is_suspended: bool,
) -> Vec<FieldError> {
    let mut errors = validate_create_for_queue_name(new);
    if !new_is_suspended && queue_name(old) != queue_name(new) {
        errors.push(FieldError::new(
            queue_name_label_path(),
            "field is immutable",
        ));
    }
    errors
}
