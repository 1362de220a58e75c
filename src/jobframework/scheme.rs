use std::collections::BTreeMap;

use kube::Resource;
use kube::api::{ApiResource, GroupVersionKind};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SchemeError {
    #[error("Kind '{0}' is already registered in the scheme")]
    AlreadyRegistered(String),
}

/// Known kinds and how to reach them through the API.
#[derive(Debug, Default, Clone)]
pub struct Scheme {
    kinds: BTreeMap<(String, String, String), ApiResource>,
}

fn key(gvk: &GroupVersionKind) -> (String, String, String) {
    (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

impl Scheme {
    pub fn add<K: Resource<DynamicType = ()>>(&mut self) -> Result<(), SchemeError> {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        let key = key(&gvk);
        if self.kinds.contains_key(&key) {
            return Err(SchemeError::AlreadyRegistered(format!(
                "{}/{}",
                gvk.api_version(),
                gvk.kind
            )));
        }
        self.kinds.insert(key, ApiResource::erase::<K>(&()));
        Ok(())
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains_key(&key(gvk))
    }

    pub fn api_resource(&self, gvk: &GroupVersionKind) -> Option<&ApiResource> {
        self.kinds.get(&key(gvk))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ApiResource> {
        self.kinds.values()
    }
}
