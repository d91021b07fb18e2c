//! Metadata helpers: group/version parsing, controlling references, label
//! selectors, and the runtime type of a fetched object.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::Resource;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unexpected GroupVersion string: {0:?}")]
pub struct GroupVersionError(pub String);

/// Split an `apiVersion` into `(group, version)`. The core group is `""`.
pub fn parse_group_version(api_version: &str) -> Result<(String, String), GroupVersionError> {
    if api_version.is_empty() || api_version == "/" {
        return Ok((String::new(), String::new()));
    }
    match api_version.split('/').collect::<Vec<_>>().as_slice() {
        [version] => Ok((String::new(), (*version).to_string())),
        [group, version] => Ok(((*group).to_string(), (*version).to_string())),
        _ => Err(GroupVersionError(api_version.to_string())),
    }
}

/// The owner reference flagged as controller, if any. The first one wins.
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// True when every pair of `selector` is present in `labels` with the same value.
pub fn is_sub_map_of(selector: &BTreeMap<String, String>, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Kind and API group an object actually carries at runtime.
pub trait TypeIdentity {
    fn type_kind(&self) -> Option<&str>;
    fn type_group(&self) -> Option<&str>;
}

impl TypeIdentity for DynamicObject {
    fn type_kind(&self) -> Option<&str> {
        self.types.as_ref().map(|t| t.kind.as_str())
    }

    fn type_group(&self) -> Option<&str> {
        let api_version = self.types.as_ref()?.api_version.as_str();
        Some(match api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        })
    }
}
