//! Wires the enabled integrations into a running process.

mod shutdown;

use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use thiserror::Error;
use tokio::select;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, instrument, warn};

pub use self::shutdown::Shutdown;
use crate::api::Workload;
use crate::config::Config;
use crate::jobframework::reconciler::SharedWorkloadIndex;
use crate::jobframework::{
    IndexError, IntegrationCallbacks, Integrations, ReconcilerContext, RegistryError, Scheme,
    SchemeError, WebhookError, WebhookRegistry, WorkloadIndex,
};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Unknown integration in config: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to set up indexes: {0}")]
    Index(#[from] IndexError),

    #[error("Failed to build scheme: {0}")]
    Scheme(#[from] SchemeError),

    #[error("Failed to set up webhooks: {0}")]
    Webhook(#[from] WebhookError),
}

/// Everything built from the enabled integrations before any watch starts.
pub struct Components {
    pub index: WorkloadIndex,
    pub scheme: Scheme,
    /// Answers admission reviews via [`WebhookRegistry::review`]. `run` does not serve it.
    pub webhooks: WebhookRegistry,
}

/// Resolves `config.frameworks` against the registry, failing on unknown names.
pub fn enabled_integrations<'a>(
    integrations: &'a Integrations,
    config: &Config,
) -> Result<Vec<(&'a str, &'a IntegrationCallbacks)>, ManagerError> {
    Ok(integrations.select(&config.frameworks)?)
}

pub fn setup_components(
    integrations: &Integrations,
    config: &Config,
) -> Result<Components, ManagerError> {
    let mut index = WorkloadIndex::default();
    let mut scheme = Scheme::default();
    let mut webhooks = WebhookRegistry::default();
    let webhook_options = config.webhook_options();

    scheme.add::<Workload>()?;
    for (name, callbacks) in enabled_integrations(integrations, config)? {
        (callbacks.setup_indexes)(&mut index)?;
        (callbacks.add_to_scheme)(&mut scheme)?;
        (callbacks.setup_webhook)(&mut webhooks, &webhook_options)?;
        info!("Integration '{}' set up", name);
    }
    for path in webhooks.paths() {
        debug!("Webhook path registered: {}", path);
    }

    Ok(Components {
        index,
        scheme,
        webhooks,
    })
}

/// Runs the Workload watcher and one controller per enabled integration until `shutdown`.
#[instrument("manager", skip_all)]
pub async fn run(
    client: Client,
    config: Config,
    integrations: Integrations,
    shutdown: Shutdown,
) -> Result<(), ManagerError> {
    let Components { index, .. } = setup_components(&integrations, &config)?;
    let workloads: SharedWorkloadIndex = Arc::new(RwLock::new(index));

    let api: Api<Workload> = match &config.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let (synced_tx, mut synced_rx) = watch::channel(false);
    let watcher_task = tokio::spawn(watch_workloads(
        api,
        workloads.clone(),
        synced_tx,
        shutdown.clone(),
    ));

    // Controllers look up owned Workloads in the index, so it has to be populated first.
    let mut waiting = shutdown.clone();
    select! {
        _ = synced_rx.wait_for(|synced| *synced) => info!("Workload cache synced"),
        _ = waiting.wait() => {
            info!("Shutdown requested before the Workload cache synced");
            let _ = watcher_task.await;
            return Ok(());
        }
    }

    let ctx = ReconcilerContext {
        client,
        workloads,
        integrations: integrations.clone(),
        options: config.reconciler_options(),
    };
    let controllers = enabled_integrations(&integrations, &config)?
        .into_iter()
        .map(|(_, callbacks)| (callbacks.new_reconciler)(ctx.clone()).run(shutdown.clone()))
        .collect::<Vec<_>>();

    join_all(controllers).await;
    if let Err(e) = watcher_task.await {
        warn!("Workload watcher task failed: {}", e);
    }
    info!("All controllers stopped");
    Ok(())
}

async fn watch_workloads(
    api: Api<Workload>,
    index: SharedWorkloadIndex,
    synced: watch::Sender<bool>,
    mut shutdown: Shutdown,
) {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut relist = Vec::new();

    loop {
        let event = select! {
            _ = shutdown.wait() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => apply_event(&index, &mut relist, event, &synced).await,
            Some(Err(e)) => warn!("Workload watch error: {}", e),
            None => break,
        }
    }
    debug!("Workload watcher stopped");
}

async fn apply_event(
    index: &RwLock<WorkloadIndex>,
    relist: &mut Vec<Workload>,
    event: Event<Workload>,
    synced: &watch::Sender<bool>,
) {
    match event {
        Event::Init => relist.clear(),
        Event::InitApply(wl) => relist.push(wl),
        Event::InitDone => {
            let mut index = index.write().await;
            index.replace_all(std::mem::take(relist));
            debug!("Workload index relisted with {} objects", index.len());
            synced.send_replace(true);
        }
        Event::Apply(wl) => index.write().await.upsert(wl),
        Event::Delete(wl) => index.write().await.remove(&wl),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    use super::*;
    use crate::api::WorkloadSpec;
    use crate::controller::{jobset, register_integrations};
    use crate::jobframework::IntegrationRegistry;
    use crate::jobframework::index::owner_reference_index_key;

    fn integrations() -> Integrations {
        let mut registry = IntegrationRegistry::default();
        register_integrations(&mut registry).unwrap();
        registry.freeze()
    }

    fn config(yaml: &str) -> Config {
        Config::from_yaml(yaml).unwrap()
    }

    fn workload(name: &str, owner: &str) -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "jobset.x-k8s.io/v1alpha2".to_string(),
                    kind: "JobSet".to_string(),
                    name: owner.to_string(),
                    uid: "uid".to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: WorkloadSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_setup_components_for_jobset() {
        let components = setup_components(&integrations(), &config("{}")).unwrap();

        assert!(components.scheme.recognizes(&jobset::gvk()));
        assert_eq!(
            components.webhooks.paths(),
            vec![jobset::MUTATE_PATH, jobset::VALIDATE_PATH]
        );
        let key = owner_reference_index_key(&jobset::gvk());
        assert!(
            components
                .index
                .lookup(&key, "default", "trainer")
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_setup_components_rejects_unknown_framework() {
        let err = setup_components(
            &integrations(),
            &config("integrations: { frameworks: [kubeflow.org/mpijob] }"),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            ManagerError::Registry(RegistryError::NotFound(name)) if name == "kubeflow.org/mpijob"
        ));
    }

    #[tokio::test]
    async fn test_apply_event_maintains_index() {
        let Components { index, .. } = setup_components(&integrations(), &config("{}")).unwrap();
        let index = RwLock::new(index);
        let (synced, synced_rx) = watch::channel(false);
        let key = owner_reference_index_key(&jobset::gvk());
        let mut relist = vec![];

        for event in [
            Event::Init,
            Event::InitApply(workload("wl-a", "trainer")),
            Event::InitApply(workload("wl-b", "other")),
        ] {
            apply_event(&index, &mut relist, event, &synced).await;
        }
        assert!(index.read().await.is_empty());
        assert!(!*synced_rx.borrow());

        apply_event(&index, &mut relist, Event::InitDone, &synced).await;
        assert_eq!(index.read().await.len(), 2);
        assert!(*synced_rx.borrow());

        apply_event(
            &index,
            &mut relist,
            Event::Apply(workload("wl-c", "trainer")),
            &synced,
        )
        .await;
        apply_event(
            &index,
            &mut relist,
            Event::Delete(workload("wl-a", "trainer")),
            &synced,
        )
        .await;

        let owned = index.read().await.lookup(&key, "default", "trainer").unwrap();
        let names: Vec<_> = owned.iter().filter_map(|wl| wl.metadata.name.clone()).collect();
        assert_eq!(names, vec!["wl-c"]);
    }
}
