//! Reconcile keys.
//!
//! Every component that needs to address an object in the work queue goes
//! through [`key_of`] (or [`deletion_key`] for deletions) so keys are derived
//! in exactly one place.

#![forbid(unsafe_code)]

use std::fmt;

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::DeletedObject;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name, cannot derive a key")]
    MissingName,
    #[error("invalid key {0:?} (expect name or namespace/name)")]
    Malformed(String),
}

/// Identity of an object inside a single kind: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Split a rendered key back into namespace and name.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Derive the key of an object from its namespace and name only.
pub fn key_of<K: Resource>(obj: &K) -> Result<ObjectKey, KeyError> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(KeyError::MissingName)?;
    Ok(ObjectKey::new(meta.namespace.as_deref(), name))
}

/// Key for a deletion: the cached tombstone key wins over live metadata,
/// which may already be gone for objects seen deleted only through a relist.
pub fn deletion_key<K: Resource>(deleted: &DeletedObject<K>) -> Result<ObjectKey, KeyError> {
    match deleted {
        DeletedObject::Final(obj) => key_of(obj),
        DeletedObject::Tombstone { key, .. } => Ok(key.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cm(ns: Option<&str>, name: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: ns.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn namespaced_and_cluster_scoped_keys() {
        assert_eq!(key_of(&cm(Some("ns"), Some("a"))).unwrap().to_string(), "ns/a");
        assert_eq!(key_of(&cm(None, Some("a"))).unwrap().to_string(), "a");
        assert_eq!(key_of(&cm(Some(""), Some("a"))).unwrap().to_string(), "a");
    }

    #[test]
    fn key_ignores_everything_but_identity() {
        let mut a = cm(Some("ns"), Some("a"));
        let mut b = cm(Some("ns"), Some("a"));
        a.metadata.resource_version = Some("1".into());
        b.metadata.resource_version = Some("42".into());
        b.metadata.labels = Some([("x".to_string(), "y".to_string())].into());
        b.data = Some([("k".to_string(), "v".to_string())].into());
        assert_eq!(key_of(&a).unwrap(), key_of(&b).unwrap());
    }

    #[test]
    fn missing_name_is_an_error() {
        assert_eq!(key_of(&cm(Some("ns"), None)), Err(KeyError::MissingName));
        assert_eq!(key_of(&cm(Some("ns"), Some(""))), Err(KeyError::MissingName));
    }

    #[test]
    fn tombstone_key_used_when_metadata_is_gone() {
        let gone: DeletedObject<ConfigMap> = DeletedObject::Tombstone {
            key: ObjectKey::new(Some("ns"), "a"),
            last_known: Some(cm(None, None)),
        };
        assert_eq!(deletion_key(&gone).unwrap().to_string(), "ns/a");
        let fin = DeletedObject::Final(cm(Some("ns"), Some("b")));
        assert_eq!(deletion_key(&fin).unwrap().to_string(), "ns/b");
    }

    #[test]
    fn parse_round_trips_rendered_keys() {
        assert_eq!(ObjectKey::parse("ns/a").unwrap(), ObjectKey::new(Some("ns"), "a"));
        assert_eq!(ObjectKey::parse("a").unwrap(), ObjectKey::new(None, "a"));
        assert!(ObjectKey::parse("a/b/c").is_err());
        assert!(ObjectKey::parse("ns/").is_err());
        assert!(ObjectKey::parse("").is_err());
    }
}
