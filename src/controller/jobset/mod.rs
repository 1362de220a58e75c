//! JobSet integration.

mod webhook;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};

use crate::api::condition::{is_status_condition_true, new_condition};
use crate::api::jobset::{JOBSET_COMPLETED, JOBSET_FAILED};
use crate::api::workload::WORKLOAD_FINISHED;
use crate::api::{Condition, JobSet, PodSet, ReplicatedJob, Workload};
use crate::jobframework::equality::containers_equal;
use crate::jobframework::maps::merge_keep_first;
use crate::jobframework::naming::workload_name_for_owner;
use crate::jobframework::reconciler::GenericReconciler;
use crate::jobframework::{
    FieldIndexer, GenericJob, IndexError, IntegrationCallbacks, IntegrationRegistry, JobObjectError,
    JobReconciler, PodSetInfo, PodSetInfoError, ReconcilerContext, RegistryError, Scheme,
    SchemeError, setup_workload_owner_index,
};

pub use self::webhook::{MUTATE_PATH, VALIDATE_PATH, setup_jobset_webhook};

pub const FRAMEWORK_NAME: &str = "jobset.x-k8s.io/jobset";
const API_VERSION_PREFIX: &str = "jobset.x-k8s.io/v1alpha2";

pub fn register(registry: &mut IntegrationRegistry) -> Result<(), RegistryError> {
    registry.register(
        FRAMEWORK_NAME,
        IntegrationCallbacks {
            new_job,
            setup_indexes,
            new_reconciler,
            setup_webhook: setup_jobset_webhook,
            job_type,
            add_to_scheme,
            is_managing_objects_owner: is_jobset,
        },
    )
}

pub fn gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(&JobSet::group(&()), &JobSet::version(&()), &JobSet::kind(&()))
}

fn job_type() -> ApiResource {
    ApiResource::erase::<JobSet>(&())
}

fn add_to_scheme(scheme: &mut Scheme) -> Result<(), SchemeError> {
    scheme.add::<JobSet>()
}

fn is_jobset(owner: &OwnerReference) -> bool {
    owner.kind == "JobSet" && owner.api_version.starts_with(API_VERSION_PREFIX)
}

fn new_job(obj: DynamicObject) -> Result<Box<dyn GenericJob>, JobObjectError> {
    Ok(Box::new(JobSetAdapter::try_from(obj)?))
}

fn new_reconciler(ctx: ReconcilerContext) -> Box<dyn JobReconciler> {
    Box::new(GenericReconciler::new(new_job, job_type(), ctx))
}

pub fn setup_indexes(indexer: &mut dyn FieldIndexer) -> Result<(), IndexError> {
    setup_workload_owner_index(indexer, &gvk())
}

pub fn workload_name_for_jobset(jobset_name: &str) -> String {
    workload_name_for_owner(jobset_name, &gvk())
}

/// Pods one replicated job asks for.
///
/// Parallelism defaults to 1 and completions to parallelism; when completions is smaller the
/// job is done before it ever reaches full parallelism. Wraps on overflow like the int32 field
/// it ends up in.
pub fn pods_count(replicas: i32, parallelism: Option<i32>, completions: Option<i32>) -> i32 {
    let parallelism = parallelism.unwrap_or(1);
    let completions = completions.unwrap_or(parallelism);
    replicas.wrapping_mul(parallelism.min(completions))
}

fn replicated_job_pods_count(rj: &ReplicatedJob) -> i32 {
    pods_count(rj.replicas, rj.parallelism(), rj.completions())
}

fn node_selector_of(rj: &ReplicatedJob) -> Option<&BTreeMap<String, String>> {
    rj.pod_spec().and_then(|s| s.node_selector.as_ref())
}

#[derive(Debug, Clone)]
pub struct JobSetAdapter(JobSet);

impl From<JobSet> for JobSetAdapter {
    fn from(jobset: JobSet) -> Self {
        Self(jobset)
    }
}

impl TryFrom<DynamicObject> for JobSetAdapter {
    type Error = JobObjectError;

    fn try_from(obj: DynamicObject) -> Result<Self, Self::Error> {
        let jobset: JobSet = serde_json::from_value(serde_json::to_value(obj)?)?;
        Ok(Self(jobset))
    }
}

impl JobSetAdapter {
    pub fn into_inner(self) -> JobSet {
        self.0
    }

    fn check_infos_len(&self, infos: &[PodSetInfo]) -> Result<(), PodSetInfoError> {
        let expected = self.0.spec.replicated_jobs.len();
        if infos.len() != expected {
            return Err(PodSetInfoError::CountMismatch {
                expected,
                actual: infos.len(),
            });
        }
        Ok(())
    }

    fn conditions(&self) -> &[Condition] {
        self.0
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

impl GenericJob for JobSetAdapter {
    fn object(&self) -> Result<DynamicObject, JobObjectError> {
        Ok(serde_json::from_value(serde_json::to_value(&self.0)?)?)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.0.metadata
    }

    fn gvk(&self) -> GroupVersionKind {
        gvk()
    }

    fn is_suspended(&self) -> bool {
        self.0.spec.suspend.unwrap_or(false)
    }

    fn is_active(&self) -> bool {
        // TODO: use the active job count once JobSet reports it in its status.
        !self.is_suspended()
    }

    fn suspend(&mut self) {
        self.0.spec.suspend = Some(true);
    }

    fn reset_status(&mut self) -> bool {
        false
    }

    fn pod_sets(&self) -> Vec<PodSet> {
        self.0
            .spec
            .replicated_jobs
            .iter()
            .map(|rj| PodSet {
                name: rj.name.clone(),
                template: rj
                    .template
                    .spec
                    .as_ref()
                    .map(|s| s.template.clone())
                    .unwrap_or_default(),
                count: replicated_job_pods_count(rj),
            })
            .collect()
    }

    fn run_with_pod_sets_info(&mut self, infos: &[PodSetInfo]) -> Result<(), PodSetInfoError> {
        if infos.is_empty() {
            self.0.spec.suspend = Some(false);
            return Ok(());
        }
        self.check_infos_len(infos)?;
        self.0.spec.suspend = Some(false);

        // Existing selector keys win, the overlay only adds missing ones.
        for (rj, info) in self.0.spec.replicated_jobs.iter_mut().zip(infos) {
            let current = node_selector_of(rj).cloned().unwrap_or_default();
            let merged = merge_keep_first(current, &info.node_selector);
            if merged.is_empty() {
                continue;
            }
            rj.pod_spec_mut().node_selector = Some(merged);
        }
        Ok(())
    }

    fn restore_pod_sets_info(&mut self, infos: &[PodSetInfo]) -> Result<bool, PodSetInfoError> {
        if infos.is_empty() {
            return Ok(false);
        }
        self.check_infos_len(infos)?;

        let mut changed = false;
        for (rj, info) in self.0.spec.replicated_jobs.iter_mut().zip(infos) {
            let current = node_selector_of(rj).cloned().unwrap_or_default();
            if current == info.node_selector {
                continue;
            }
            rj.pod_spec_mut().node_selector =
                (!info.node_selector.is_empty()).then(|| info.node_selector.clone());
            changed = true;
        }
        Ok(changed)
    }

    fn finished(&self) -> Option<Condition> {
        let message = if is_status_condition_true(self.conditions(), JOBSET_COMPLETED) {
            "JobSet finished successfully"
        } else if is_status_condition_true(self.conditions(), JOBSET_FAILED) {
            "JobSet failed"
        } else {
            return None;
        };
        Some(new_condition(
            WORKLOAD_FINISHED,
            true,
            "JobSetFinished",
            message,
        ))
    }

    fn equivalent_to_workload(&self, workload: &Workload) -> bool {
        let pod_sets = &workload.spec.pod_sets;
        let replicated_jobs = &self.0.spec.replicated_jobs;
        if pod_sets.len() != replicated_jobs.len() {
            return false;
        }

        replicated_jobs.iter().zip(pod_sets).all(|(rj, ps)| {
            if ps.count != replicated_job_pods_count(rj) {
                return false;
            }
            let job_spec = rj.pod_spec();
            let wl_spec = ps.template.spec.as_ref();
            containers_equal(
                job_spec.and_then(|s| s.init_containers.as_deref()),
                wl_spec.and_then(|s| s.init_containers.as_deref()),
            ) && containers_equal(
                job_spec.map(|s| s.containers.as_slice()),
                wl_spec.map(|s| s.containers.as_slice()),
            )
        })
    }

    fn priority_class(&self) -> String {
        self.0
            .spec
            .replicated_jobs
            .iter()
            .filter_map(|rj| rj.pod_spec()?.priority_class_name.as_deref())
            .find(|name| !name.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    fn pods_ready(&self) -> bool {
        let replicas = self
            .0
            .spec
            .replicated_jobs
            .iter()
            .fold(0i32, |acc, rj| acc.wrapping_add(rj.replicas));
        let ready = self
            .0
            .status
            .iter()
            .flat_map(|s| &s.replicated_jobs_status)
            .fold(0i32, |acc, s| acc.wrapping_add(s.ready).wrapping_add(s.succeeded));
        replicas == ready
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::api::condition::is_condition_true;
    use crate::api::{JobSetStatus, ReplicatedJobStatus};
    use crate::jobframework::workload::construct_workload;

    const TRAINER: &str = r#"
      apiVersion: jobset.x-k8s.io/v1alpha2
      kind: JobSet
      metadata:
        name: trainer
        namespace: default
        uid: "0f9c"
      spec:
        replicatedJobs:
          - name: leader
            replicas: 1
            template:
              spec:
                template:
                  spec:
                    nodeSelector:
                      zone: b
                    containers:
                      - name: main
                        image: trainer:v1
          - name: workers
            replicas: 2
            template:
              spec:
                parallelism: 2
                completions: 4
                template:
                  spec:
                    priorityClassName: high
                    initContainers:
                      - name: fetch
                        image: fetcher:v1
                    containers:
                      - name: main
                        image: trainer:v1
    "#;

    fn trainer() -> JobSetAdapter {
        JobSetAdapter::from(serde_yaml::from_str::<JobSet>(TRAINER).unwrap())
    }

    fn selector(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn info(name: &str, pairs: &[(&str, &str)]) -> PodSetInfo {
        PodSetInfo {
            name: name.to_string(),
            node_selector: selector(pairs),
        }
    }

    fn selectors(job: &JobSetAdapter) -> Vec<Option<BTreeMap<String, String>>> {
        job.0
            .spec
            .replicated_jobs
            .iter()
            .map(|rj| node_selector_of(rj).cloned())
            .collect()
    }

    fn with_status(job: JobSetAdapter, status: JobSetStatus) -> JobSetAdapter {
        let mut js = job.into_inner();
        js.status = Some(status);
        JobSetAdapter::from(js)
    }

    #[test]
    fn test_pods_count() {
        assert_eq!(pods_count(3, Some(2), Some(5)), 6);
        assert_eq!(pods_count(3, Some(5), Some(2)), 6);
        assert_eq!(pods_count(2, None, None), 2);
        assert_eq!(pods_count(4, Some(3), None), 12);
        assert_eq!(pods_count(0, Some(3), Some(3)), 0);
    }

    #[test]
    fn test_pods_count_wraps_on_overflow() {
        assert_eq!(
            pods_count(50_000, Some(50_000), None),
            50_000i32.wrapping_mul(50_000)
        );
        assert_eq!(pods_count(i32::MAX, Some(2), Some(2)), -2);

        let mut js = trainer().into_inner();
        for rj in &mut js.spec.replicated_jobs {
            rj.replicas = i32::MAX;
        }
        let job = with_status(
            JobSetAdapter::from(js),
            JobSetStatus {
                replicated_jobs_status: vec![ReplicatedJobStatus {
                    name: "leader".to_string(),
                    ready: i32::MAX,
                    succeeded: i32::MAX,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        assert_eq!(job.pod_sets().len(), 2);
        assert!(job.pods_ready());
    }

    #[test]
    fn test_suspend() {
        let mut job = trainer();
        assert!(!job.is_suspended());
        assert!(job.is_active());

        job.suspend();
        assert!(job.is_suspended());
        assert!(!job.is_active());

        job.suspend();
        assert_eq!(job.0.spec.suspend, Some(true));
        assert!(!job.reset_status());
    }

    #[test]
    fn test_pod_sets() {
        let job = trainer();
        let pod_sets = job.pod_sets();

        assert_eq!(pod_sets.len(), job.0.spec.replicated_jobs.len());
        assert_eq!(pod_sets[0].name, "leader");
        assert_eq!(pod_sets[0].count, 1);
        assert_eq!(pod_sets[1].name, "workers");
        assert_eq!(pod_sets[1].count, 4);
        assert_eq!(
            pod_sets[0].template.spec.as_ref().unwrap().node_selector,
            Some(selector(&[("zone", "b")]))
        );
    }

    #[test]
    fn test_pod_sets_are_copies() {
        let job = trainer();
        let mut pod_sets = job.pod_sets();
        pod_sets[0].template.spec.as_mut().unwrap().node_selector = None;

        assert_eq!(selectors(&job)[0], Some(selector(&[("zone", "b")])));
    }

    #[test]
    fn test_run_with_empty_infos_only_resumes() {
        let mut job = trainer();
        job.suspend();
        job.run_with_pod_sets_info(&[]).unwrap();

        assert!(!job.is_suspended());
        assert_eq!(selectors(&job), selectors(&trainer()));
    }

    #[test]
    fn test_run_with_infos_keeps_existing_keys() {
        let mut job = trainer();
        job.suspend();
        job.run_with_pod_sets_info(&[
            info("leader", &[("zone", "a"), ("gpu", "a100")]),
            info("workers", &[("zone", "a")]),
        ])
        .unwrap();

        assert!(!job.is_suspended());
        assert_eq!(
            selectors(&job),
            vec![
                Some(selector(&[("zone", "b"), ("gpu", "a100")])),
                Some(selector(&[("zone", "a")])),
            ]
        );
    }

    #[test]
    fn test_run_with_empty_selectors_leaves_missing_templates_alone() {
        let mut js = trainer().into_inner();
        js.spec.replicated_jobs[1].template.spec = None;
        let mut job = JobSetAdapter::from(js);
        job.suspend();

        job.run_with_pod_sets_info(&[info("leader", &[]), info("workers", &[])])
            .unwrap();

        assert!(!job.is_suspended());
        assert!(job.0.spec.replicated_jobs[1].template.spec.is_none());
        assert_eq!(
            selectors(&job)[0],
            Some(selector(&[("zone", "b")]))
        );
    }

    #[test]
    fn test_run_with_mismatched_infos_is_rejected_untouched() {
        let mut job = trainer();
        job.suspend();
        let before = job.0.clone();

        assert_eq!(
            job.run_with_pod_sets_info(&[info("leader", &[("zone", "a")])]),
            Err(PodSetInfoError::CountMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(job.0.spec, before.spec);
    }

    #[test]
    fn test_restore_replaces_drifted_selectors() {
        let mut job = trainer();
        let changed = job
            .restore_pod_sets_info(&[info("leader", &[("zone", "c")]), info("workers", &[])])
            .unwrap();

        assert!(changed);
        assert_eq!(selectors(&job), vec![Some(selector(&[("zone", "c")])), None]);
    }

    #[test]
    fn test_restore_is_noop_when_equal() {
        let mut job = trainer();
        let before = job.0.clone();

        let changed = job
            .restore_pod_sets_info(&[info("leader", &[("zone", "b")]), info("workers", &[])])
            .unwrap();
        assert!(!changed);
        assert_eq!(job.0.spec, before.spec);

        assert!(!job.restore_pod_sets_info(&[]).unwrap());
        assert!(job.restore_pod_sets_info(&[info("leader", &[])]).is_err());
        assert_eq!(job.0.spec, before.spec);
    }

    #[test]
    fn test_finished() {
        let condition = |type_: &str, status: bool| new_condition(type_, status, "", "");
        assert_eq!(trainer().finished(), None);

        let job = with_status(
            trainer(),
            JobSetStatus {
                conditions: vec![condition("Failed", true), condition("Completed", true)],
                ..Default::default()
            },
        );
        let finished = job.finished().unwrap();
        assert_eq!(finished.type_, WORKLOAD_FINISHED);
        assert!(is_condition_true(&finished));
        assert_eq!(finished.reason, "JobSetFinished");
        assert_eq!(finished.message, "JobSet finished successfully");

        let job = with_status(
            trainer(),
            JobSetStatus {
                conditions: vec![condition("Completed", false), condition("Failed", true)],
                ..Default::default()
            },
        );
        assert_eq!(job.finished().unwrap().message, "JobSet failed");

        let job = with_status(
            trainer(),
            JobSetStatus {
                conditions: vec![condition("Completed", false), condition("Failed", false)],
                ..Default::default()
            },
        );
        assert_eq!(job.finished(), None);
    }

    #[test]
    fn test_equivalent_to_workload() {
        let job = trainer();
        let workload = construct_workload(&job, None).unwrap();
        assert!(job.equivalent_to_workload(&workload));

        let mut shorter = workload.clone();
        shorter.spec.pod_sets.pop();
        assert!(!job.equivalent_to_workload(&shorter));

        let mut recounted = workload.clone();
        recounted.spec.pod_sets[1].count = 5;
        assert!(!job.equivalent_to_workload(&recounted));

        let mut new_image = workload.clone();
        new_image.spec.pod_sets[0].template.spec.as_mut().unwrap().containers[0].image =
            Some("trainer:v2".to_string());
        assert!(!job.equivalent_to_workload(&new_image));

        let mut new_resources = workload.clone();
        new_resources.spec.pod_sets[0].template.spec.as_mut().unwrap().containers[0].resources =
            Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity("2".to_string()),
                )])),
                ..Default::default()
            });
        assert!(!job.equivalent_to_workload(&new_resources));

        let mut same_cpu = new_resources.clone();
        same_cpu.spec.pod_sets[0].template.spec.as_mut().unwrap().containers[0]
            .resources
            .as_mut()
            .unwrap()
            .requests = Some(BTreeMap::from([(
            "cpu".to_string(),
            Quantity("2000m".to_string()),
        )]));
        let mut js = job.clone().into_inner();
        js.spec.replicated_jobs[0].pod_spec_mut().containers[0].resources =
            new_resources.spec.pod_sets[0].template.spec.as_ref().unwrap().containers[0]
                .resources
                .clone();
        assert!(JobSetAdapter::from(js).equivalent_to_workload(&same_cpu));

        let mut no_init = workload.clone();
        no_init.spec.pod_sets[1].template.spec.as_mut().unwrap().init_containers = None;
        assert!(!job.equivalent_to_workload(&no_init));
    }

    #[test]
    fn test_equivalent_ignores_node_selector_and_empty_init_containers() {
        let job = trainer();
        let mut workload = construct_workload(&job, None).unwrap();
        let leader = workload.spec.pod_sets[0].template.spec.as_mut().unwrap();
        leader.node_selector = Some(selector(&[("zone", "a")]));
        leader.init_containers = Some(vec![]);

        assert!(job.equivalent_to_workload(&workload));
    }

    #[test]
    fn test_priority_class() {
        assert_eq!(trainer().priority_class(), "high");

        let mut js = trainer().into_inner();
        js.spec.replicated_jobs[0].pod_spec_mut().priority_class_name = Some("low".to_string());
        assert_eq!(JobSetAdapter::from(js.clone()).priority_class(), "low");

        for rj in js.spec.replicated_jobs.iter_mut() {
            rj.pod_spec_mut().priority_class_name = Some(String::new());
        }
        assert_eq!(JobSetAdapter::from(js).priority_class(), "");
    }

    #[test]
    fn test_pods_ready() {
        let rj_status = |name: &str, ready: i32, succeeded: i32| ReplicatedJobStatus {
            name: name.to_string(),
            ready,
            succeeded,
            ..Default::default()
        };
        let mut js = trainer().into_inner();
        js.spec.replicated_jobs[0].replicas = 3;

        let ready = with_status(
            JobSetAdapter::from(js.clone()),
            JobSetStatus {
                replicated_jobs_status: vec![rj_status("leader", 2, 1), rj_status("workers", 1, 1)],
                ..Default::default()
            },
        );
        assert!(ready.pods_ready());

        let not_ready = with_status(
            JobSetAdapter::from(js.clone()),
            JobSetStatus {
                replicated_jobs_status: vec![rj_status("leader", 2, 0), rj_status("workers", 1, 1)],
                ..Default::default()
            },
        );
        assert!(!not_ready.pods_ready());
        assert!(!JobSetAdapter::from(js).pods_ready());
    }

    #[test]
    fn test_object_roundtrips_through_dynamic() {
        let job = trainer();
        let obj = job.object().unwrap();
        assert_eq!(obj.metadata.name.as_deref(), Some("trainer"));
        assert_eq!(
            obj.types.as_ref().map(|t| t.kind.as_str()),
            Some("JobSet")
        );

        let back = JobSetAdapter::try_from(obj).unwrap();
        assert_eq!(back.0.spec, job.0.spec);
    }

    #[test]
    fn test_is_jobset_owner() {
        let owner = OwnerReference {
            api_version: "jobset.x-k8s.io/v1alpha2".to_string(),
            kind: "JobSet".to_string(),
            name: "trainer".to_string(),
            uid: "0f9c".to_string(),
            ..Default::default()
        };
        assert!(is_jobset(&owner));
        assert!(!is_jobset(&OwnerReference {
            api_version: "jobset.x-k8s.io/v1alpha1".to_string(),
            ..owner.clone()
        }));
        assert!(!is_jobset(&OwnerReference {
            kind: "Job".to_string(),
            ..owner
        }));
    }

    #[test]
    fn test_workload_name_for_jobset() {
        assert!(workload_name_for_jobset("trainer").starts_with("jobset-trainer-"));
    }
}
