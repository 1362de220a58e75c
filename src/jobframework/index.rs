use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use kube::api::GroupVersionKind;
use thiserror::Error;
use tracing::debug;

use crate::api::Workload;

pub type IndexFn = Box<dyn Fn(&Workload) -> Vec<String> + Send + Sync>;

#[derive(Error, Debug, PartialEq)]
pub enum IndexError {
    #[error("Index field '{0}' is already registered")]
    DuplicateField(String),

    #[error("Index field '{0}' is not registered")]
    UnknownField(String),
}

/// Registration side of a field index over Workloads.
pub trait FieldIndexer {
    fn index_field(&mut self, field: String, extract: IndexFn) -> Result<(), IndexError>;
}

pub fn owner_reference_index_key(owner_gvk: &GroupVersionKind) -> String {
    format!(
        ".metadata.ownerReferences[{}.{}]",
        owner_gvk.group, owner_gvk.kind
    )
}

/// Indexes Workloads by the names of their owners of kind `owner_gvk`.
pub fn setup_workload_owner_index(
    indexer: &mut dyn FieldIndexer,
    owner_gvk: &GroupVersionKind,
) -> Result<(), IndexError> {
    let api_version = owner_gvk.api_version();
    let kind = owner_gvk.kind.clone();
    indexer.index_field(
        owner_reference_index_key(owner_gvk),
        Box::new(move |wl: &Workload| {
            wl.owner_references()
                .iter()
                .filter(|o| o.api_version == api_version && o.kind == kind)
                .map(|o| o.name.clone())
                .collect()
        }),
    )
}

type ObjectKey = (String, String);

/// In-memory Workload cache with inverted field indexes.
#[derive(Default)]
pub struct WorkloadIndex {
    extractors: BTreeMap<String, IndexFn>,
    objects: BTreeMap<ObjectKey, Workload>,
    /// field -> (namespace, value) -> names
    entries: BTreeMap<String, BTreeMap<ObjectKey, BTreeSet<String>>>,
}

impl FieldIndexer for WorkloadIndex {
    fn index_field(&mut self, field: String, extract: IndexFn) -> Result<(), IndexError> {
        if self.extractors.contains_key(&field) {
            return Err(IndexError::DuplicateField(field));
        }
        let mut entries: BTreeMap<ObjectKey, BTreeSet<String>> = BTreeMap::new();
        for ((namespace, name), wl) in &self.objects {
            for value in extract(wl) {
                entries
                    .entry((namespace.clone(), value))
                    .or_default()
                    .insert(name.clone());
            }
        }
        debug!("Registered workload index '{}'", field);
        self.entries.insert(field.clone(), entries);
        self.extractors.insert(field, extract);
        Ok(())
    }
}

impl WorkloadIndex {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn upsert(&mut self, wl: Workload) {
        let key = (wl.namespace().unwrap_or_default(), wl.name_any());
        self.remove_entries(&key);
        for (field, extract) in &self.extractors {
            let entries = self.entries.entry(field.clone()).or_default();
            for value in extract(&wl) {
                entries
                    .entry((key.0.clone(), value))
                    .or_default()
                    .insert(key.1.clone());
            }
        }
        self.objects.insert(key, wl);
    }

    pub fn remove(&mut self, wl: &Workload) {
        let key = (wl.namespace().unwrap_or_default(), wl.name_any());
        self.remove_entries(&key);
        self.objects.remove(&key);
    }

    /// Swaps the whole cache, used after a watcher relist.
    pub fn replace_all(&mut self, workloads: Vec<Workload>) {
        self.objects.clear();
        self.entries.values_mut().for_each(BTreeMap::clear);
        for wl in workloads {
            self.upsert(wl);
        }
    }

    pub fn lookup(
        &self,
        field: &str,
        namespace: &str,
        value: &str,
    ) -> Result<Vec<Workload>, IndexError> {
        let entries = self
            .entries
            .get(field)
            .ok_or_else(|| IndexError::UnknownField(field.to_string()))?;
        let Some(names) = entries.get(&(namespace.to_string(), value.to_string())) else {
            return Ok(vec![]);
        };
        Ok(names
            .iter()
            .filter_map(|name| {
                self.objects
                    .get(&(namespace.to_string(), name.clone()))
                    .cloned()
            })
            .collect())
    }

    fn remove_entries(&mut self, key: &ObjectKey) {
        let Some(old) = self.objects.get(key) else {
            return;
        };
        for (field, extract) in &self.extractors {
            let Some(entries) = self.entries.get_mut(field) else {
                continue;
            };
            for value in extract(old) {
                let index_key = (key.0.clone(), value);
                if let Some(names) = entries.get_mut(&index_key) {
                    names.remove(&key.1);
                    if names.is_empty() {
                        entries.remove(&index_key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;
    use crate::api::WorkloadSpec;

    fn jobset_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("jobset.x-k8s.io", "v1alpha2", "JobSet")
    }

    fn owned_workload(name: &str, namespace: &str, owner_kind: &str, owner: &str) -> Workload {
        let mut wl = Workload::new(name, WorkloadSpec::default());
        wl.metadata.namespace = Some(namespace.to_string());
        wl.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "jobset.x-k8s.io/v1alpha2".to_string(),
            kind: owner_kind.to_string(),
            name: owner.to_string(),
            uid: format!("{owner}-uid"),
            controller: Some(true),
            ..Default::default()
        }]);
        wl
    }

    fn owner_index() -> WorkloadIndex {
        let mut index = WorkloadIndex::default();
        setup_workload_owner_index(&mut index, &jobset_gvk()).unwrap();
        index
    }

    #[test]
    fn test_lookup_by_owner() {
        let mut index = owner_index();
        index.upsert(owned_workload("wl-a", "default", "JobSet", "trainer"));
        index.upsert(owned_workload("wl-b", "default", "JobSet", "trainer"));
        index.upsert(owned_workload("wl-c", "other", "JobSet", "trainer"));
        index.upsert(owned_workload("wl-d", "default", "Job", "trainer"));

        let key = owner_reference_index_key(&jobset_gvk());
        let found: Vec<String> = index
            .lookup(&key, "default", "trainer")
            .unwrap()
            .iter()
            .map(|wl| wl.name_any())
            .collect();
        assert_eq!(found, vec!["wl-a", "wl-b"]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_upsert_moves_entries_and_remove_drops_them() {
        let mut index = owner_index();
        let key = owner_reference_index_key(&jobset_gvk());
        index.upsert(owned_workload("wl-a", "default", "JobSet", "trainer"));
        index.upsert(owned_workload("wl-a", "default", "JobSet", "evaluator"));

        assert!(index.lookup(&key, "default", "trainer").unwrap().is_empty());
        assert_eq!(index.lookup(&key, "default", "evaluator").unwrap().len(), 1);

        let wl = owned_workload("wl-a", "default", "JobSet", "evaluator");
        index.remove(&wl);
        assert!(index.lookup(&key, "default", "evaluator").unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_field_registered_after_objects_is_backfilled() {
        let mut index = WorkloadIndex::default();
        index.upsert(owned_workload("wl-a", "default", "JobSet", "trainer"));
        setup_workload_owner_index(&mut index, &jobset_gvk()).unwrap();

        let key = owner_reference_index_key(&jobset_gvk());
        assert_eq!(index.lookup(&key, "default", "trainer").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_and_unknown_fields() {
        let mut index = owner_index();
        let key = owner_reference_index_key(&jobset_gvk());
        assert_eq!(
            setup_workload_owner_index(&mut index, &jobset_gvk()),
            Err(IndexError::DuplicateField(key))
        );
        assert!(matches!(
            index.lookup("nope", "default", "x"),
            Err(IndexError::UnknownField(_))
        ));
    }

    #[test]
    fn test_replace_all() {
        let mut index = owner_index();
        index.upsert(owned_workload("wl-a", "default", "JobSet", "trainer"));
        index.replace_all(vec![owned_workload("wl-b", "default", "JobSet", "other")]);

        let key = owner_reference_index_key(&jobset_gvk());
        assert!(index.lookup(&key, "default", "trainer").unwrap().is_empty());
        assert_eq!(index.lookup(&key, "default", "other").unwrap().len(), 1);
    }
}
