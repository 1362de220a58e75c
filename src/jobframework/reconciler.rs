//! Generic reconciler shared by every integration.
//!
//! Decisions are made by [`plan`] from the job and the Workloads it owns; the reconciler only
//! executes the resulting steps against the API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use derive_debug::Dbg;
use futures::StreamExt;
use futures::future::BoxFuture;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams,
};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use thiserror::Error;
use tokio::sync::{RwLock, oneshot};
use tracing::{Instrument, debug, error, info, instrument, trace_span, warn};
use tracing_error::{ExtractSpanTrace, SpanTrace};

use super::index::{IndexError, WorkloadIndex, owner_reference_index_key};
use super::registry::{Integrations, NewJobFn};
use super::workload::{
    AdmissionError, construct_workload, pod_set_infos_from_admission, pod_set_infos_from_workload,
};
use super::{GenericJob, JobObjectError, MANAGER_NAME, PodSetInfo, PodSetInfoError, queue_name};
use crate::api::condition::{
    Time, find_status_condition, is_condition_true, new_condition, set_status_condition,
};
use crate::api::workload::WORKLOAD_PODS_READY;
use crate::api::{Admission, Condition, ResourceFlavor, Workload};
use crate::error::{SpannedErr, SpannedExt};
use crate::manager::Shutdown;

pub type SharedWorkloadIndex = Arc<RwLock<WorkloadIndex>>;

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub namespace: Option<String>,
    pub manage_jobs_without_queue_name: bool,
    pub wait_for_pods_ready: bool,
    pub requeue_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            manage_jobs_without_queue_name: false,
            wait_for_pods_ready: false,
            requeue_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Dbg, Clone)]
pub struct ReconcilerContext {
    #[dbg(skip)]
    pub client: Client,
    #[dbg(skip)]
    pub workloads: SharedWorkloadIndex,
    pub integrations: Integrations,
    pub options: ReconcilerOptions,
}

pub trait JobReconciler: Send {
    /// Drives the controller for one job kind until `shutdown` fires.
    fn run(self: Box<Self>, shutdown: Shutdown) -> BoxFuture<'static, ()>;
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes client error: {0}")]
    KubeClient(#[from] SpannedErr<kube::Error>),

    #[error("Invalid job object: {0}")]
    JobObject(#[from] JobObjectError),

    #[error("Pod set infos do not fit the job: {0}")]
    PodSetInfo(#[from] PodSetInfoError),

    #[error("Admission cannot be applied: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Workload index error: {0}")]
    Index(#[from] IndexError),
}

impl ExtractSpanTrace for ReconcileError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            ReconcileError::KubeClient(e) => e.span_trace(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Suspend the job and put its pod templates back to `restore`.
    StopJob { restore: Vec<PodSetInfo> },
    StartJob(Admission),
    CreateWorkload,
    DeleteWorkload(String),
    SetWorkloadCondition {
        workload: String,
        condition: Condition,
    },
}

pub fn pods_ready_condition(ready: bool) -> Condition {
    let message = if ready {
        "All pods were ready or succeeded since the workload admission"
    } else {
        "Not all pods are ready or succeeded"
    };
    new_condition(WORKLOAD_PODS_READY, ready, "PodsReady", message)
}

fn restore_infos(job: &dyn GenericJob, workload: &Workload) -> Vec<PodSetInfo> {
    let infos = pod_set_infos_from_workload(workload);
    if infos.len() == job.pod_sets().len() {
        infos
    } else {
        vec![]
    }
}

/// Decides what has to happen for `job` given the Workloads it owns.
pub fn plan(job: &dyn GenericJob, owned: &[Workload], options: &ReconcilerOptions) -> Vec<Step> {
    let mut steps = vec![];
    if queue_name(job.meta()).is_none() && !options.manage_jobs_without_queue_name {
        return steps;
    }

    let matched = owned.iter().position(|wl| job.equivalent_to_workload(wl));
    let stale: Vec<&Workload> = owned
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != matched)
        .map(|(_, wl)| wl)
        .collect();

    if let Some(condition) = job.finished() {
        if let Some(wl) = matched.map(|i| &owned[i]).or(owned.first())
            && !wl.is_finished()
        {
            steps.push(Step::SetWorkloadCondition {
                workload: wl.name_any(),
                condition,
            });
        }
        return steps;
    }

    let Some(wl) = matched.map(|i| &owned[i]) else {
        // Recreate only once the stale ones are gone, the name is deterministic.
        if let Some(first) = stale.first() {
            if job.is_active() {
                steps.push(Step::StopJob {
                    restore: restore_infos(job, first),
                });
            }
            steps.extend(stale.iter().map(|wl| Step::DeleteWorkload(wl.name_any())));
            return steps;
        }
        if job.is_active() {
            steps.push(Step::StopJob { restore: vec![] });
        }
        steps.push(Step::CreateWorkload);
        return steps;
    };

    steps.extend(stale.iter().map(|wl| Step::DeleteWorkload(wl.name_any())));

    if options.wait_for_pods_ready && wl.is_admitted() {
        let ready = job.pods_ready();
        let recorded = find_status_condition(wl.conditions(), WORKLOAD_PODS_READY);
        if recorded.is_none_or(|c| is_condition_true(c) != ready) {
            steps.push(Step::SetWorkloadCondition {
                workload: wl.name_any(),
                condition: pods_ready_condition(ready),
            });
        }
    }

    if job.is_suspended() {
        if let Some(admission) = wl.admission() {
            steps.push(Step::StartJob(admission.clone()));
        }
    } else if !wl.is_admitted() {
        steps.push(Step::StopJob {
            restore: restore_infos(job, wl),
        });
    }

    steps
}

#[derive(Dbg)]
pub struct GenericReconciler {
    #[dbg(skip)]
    new_job: NewJobFn,
    job_type: ApiResource,
    owner_index_key: String,
    ctx: ReconcilerContext,
}

impl GenericReconciler {
    pub fn new(new_job: NewJobFn, job_type: ApiResource, ctx: ReconcilerContext) -> Self {
        let gvk = GroupVersionKind::gvk(&job_type.group, &job_type.version, &job_type.kind);
        Self {
            new_job,
            owner_index_key: owner_reference_index_key(&gvk),
            job_type,
            ctx,
        }
    }

    fn client(&self) -> Client {
        self.ctx.client.clone()
    }

    #[instrument(
        "reconcile",
        skip(self, obj),
        fields(kind = %self.job_type.kind, object = %obj.name_any())
    )]
    pub async fn reconcile(&self, obj: &DynamicObject) -> Result<Action, ReconcileError> {
        let mut job = (self.new_job)(obj.clone())?;
        let namespace = job
            .meta()
            .namespace
            .clone()
            .ok_or(JobObjectError::MissingField("namespace"))?;
        let name = job
            .meta()
            .name
            .clone()
            .ok_or(JobObjectError::MissingField("name"))?;

        if job
            .meta()
            .owner_references
            .iter()
            .flatten()
            .any(|o| self.ctx.integrations.is_managing_objects_owner(o))
        {
            debug!("Owner is managed by another integration, skipping");
            return Ok(Action::await_change());
        }

        let owned = self
            .ctx
            .workloads
            .read()
            .await
            .lookup(&self.owner_index_key, &namespace, &name)?;

        let steps = plan(job.as_ref(), &owned, &self.ctx.options);
        let mut job_changed = false;
        let mut status_reset = false;

        for step in steps {
            debug!(?step, "Executing step");
            match step {
                Step::StopJob { restore } => {
                    if job.is_active() {
                        job.suspend();
                        job_changed = true;
                        info!("Suspending job '{}'", name);
                    }
                    job_changed |= job.restore_pod_sets_info(&restore)?;
                    status_reset |= job.reset_status();
                }
                Step::StartJob(admission) => {
                    let flavors = self.fetch_flavors(&admission).await?;
                    let infos = pod_set_infos_from_admission(&admission, &flavors)?;
                    job.run_with_pod_sets_info(&infos)?;
                    job_changed = true;
                    info!(
                        "Starting job '{}' admitted by cluster queue '{}'",
                        name, admission.cluster_queue
                    );
                }
                Step::CreateWorkload => self.create_workload(job.as_ref()).await?,
                Step::DeleteWorkload(workload) => {
                    self.delete_workload(&namespace, &workload).await?
                }
                Step::SetWorkloadCondition {
                    workload,
                    condition,
                } => {
                    self.set_workload_condition(&owned, &workload, condition)
                        .await?
                }
            }
        }

        if job_changed {
            self.persist_job(job.as_ref(), &namespace, &name, status_reset)
                .await?;
        }

        Ok(Action::requeue(self.ctx.options.requeue_interval))
    }

    async fn persist_job(
        &self,
        job: &dyn GenericJob,
        namespace: &str,
        name: &str,
        status_reset: bool,
    ) -> Result<(), ReconcileError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client(), namespace, &self.job_type);
        let params = PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..Default::default()
        };
        let object = job.object()?;

        let updated = async { api.replace(name, &params, &object).await.with_span_trace() }
            .instrument(trace_span!("replace_job"))
            .await?;

        if status_reset {
            let mut status = object;
            status.metadata.resource_version = updated.metadata.resource_version;
            let body = serde_json::to_vec(&status).map_err(JobObjectError::from)?;
            api.replace_status(name, &params, body)
                .await
                .with_span_trace()?;
        }
        Ok(())
    }

    async fn fetch_flavors(
        &self,
        admission: &Admission,
    ) -> Result<BTreeMap<String, ResourceFlavor>, ReconcileError> {
        let api: Api<ResourceFlavor> = Api::all(self.client());
        let mut flavors = BTreeMap::new();
        for name in admission
            .pod_set_assignments
            .iter()
            .flat_map(|a| a.flavors.values())
        {
            if flavors.contains_key(name) {
                continue;
            }
            if let Some(flavor) = api.get_opt(name).await.with_span_trace()? {
                flavors.insert(name.clone(), flavor);
            }
        }
        Ok(flavors)
    }

    async fn create_workload(&self, job: &dyn GenericJob) -> Result<(), ReconcileError> {
        let priority_class = job.priority_class();
        let priority = if priority_class.is_empty() {
            None
        } else {
            let api: Api<PriorityClass> = Api::all(self.client());
            match api.get_opt(&priority_class).await.with_span_trace()? {
                Some(pc) => Some(pc.value),
                None => {
                    warn!("Priority class '{}' not found", priority_class);
                    None
                }
            }
        };

        let workload = construct_workload(job, priority)?;
        let namespace = workload.namespace().unwrap_or_default();
        let api: Api<Workload> = Api::namespaced(self.client(), &namespace);
        let params = PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..Default::default()
        };
        match api.create(&params, &workload).await {
            Ok(created) => {
                info!("Created workload '{}'", created.name_any());
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("Workload '{}' already exists", workload.name_any());
                Ok(())
            }
            Err(e) => Err(e).with_span_trace().map_err(ReconcileError::KubeClient),
        }
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let api: Api<Workload> = Api::namespaced(self.client(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("Deleted workload '{}'", name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_span_trace().map_err(ReconcileError::KubeClient),
        }
    }

    async fn set_workload_condition(
        &self,
        owned: &[Workload],
        name: &str,
        condition: Condition,
    ) -> Result<(), ReconcileError> {
        let Some(workload) = owned.iter().find(|wl| wl.name_any() == name) else {
            return Ok(());
        };
        let type_ = condition.type_.clone();
        let patch = workload_condition_patch(workload, condition, Time(chrono::Utc::now()));

        let api: Api<Workload> =
            Api::namespaced(self.client(), &workload.namespace().unwrap_or_default());
        api.patch_status(
            name,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&patch),
        )
        .await
        .with_span_trace()?;
        info!("Set condition '{}' on workload '{}'", type_, name);
        Ok(())
    }
}

/// Server-side apply body that owns exactly one condition of `workload`.
///
/// `status.conditions` is a list map keyed by type, so entries written by other managers stay.
/// The cached conditions only decide the transition time.
pub fn workload_condition_patch(
    workload: &Workload,
    condition: Condition,
    now: Time,
) -> serde_json::Value {
    let mut conditions = workload.conditions().to_vec();
    let stored = set_status_condition(&mut conditions, condition, now);
    serde_json::json!({
        "apiVersion": Workload::api_version(&()),
        "kind": Workload::kind(&()),
        "status": { "conditions": [stored] },
    })
}

async fn reconcile_job(
    obj: Arc<DynamicObject>,
    reconciler: Arc<GenericReconciler>,
) -> Result<Action, ReconcileError> {
    reconciler.reconcile(&obj).await
}

fn error_policy(
    obj: Arc<DynamicObject>,
    err: &ReconcileError,
    reconciler: Arc<GenericReconciler>,
) -> Action {
    crate::error::report(
        &format!("Failed to reconcile '{}'", obj.name_any()),
        err,
        err.span_trace(),
    );
    Action::requeue(reconciler.ctx.options.error_backoff)
}

impl JobReconciler for GenericReconciler {
    fn run(self: Box<Self>, mut shutdown: Shutdown) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let client = self.client();
            let (jobs, workloads): (Api<DynamicObject>, Api<Workload>) =
                match &self.ctx.options.namespace {
                    Some(ns) => (
                        Api::namespaced_with(client.clone(), ns, &self.job_type),
                        Api::namespaced(client, ns),
                    ),
                    None => (Api::all_with(client.clone(), &self.job_type), Api::all(client)),
                };
            let job_type = self.job_type.clone();
            let kind = job_type.kind.clone();
            info!("Starting controller for kind '{}'", kind);

            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                shutdown.wait().await;
                let _ = stop_tx.send(());
            });

            Controller::new_with(jobs, watcher::Config::default(), job_type)
                .owns(workloads, watcher::Config::default())
                .graceful_shutdown_on(async move {
                    let _ = stop_rx.await;
                })
                .run(reconcile_job, error_policy, Arc::new(*self))
                .for_each(|res| async move {
                    match res {
                        Ok((obj, _)) => debug!("Reconciled {}", obj),
                        Err(e) => error!("Controller error: {}", e),
                    }
                })
                .await;

            info!("Controller for kind '{}' stopped", kind);
        })
    }
}
