//! Controller resolution for owned objects.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::Resource;
use tikvop_core::{controller_of, parse_group_version, GroupVersionError, StoreError, TypeIdentity};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("cannot parse group version for the controller {kind}/{name} of {child}")]
    GroupVersion {
        child: String,
        kind: String,
        name: String,
        #[source]
        source: GroupVersionError,
    },
    #[error("cannot get controller {namespace}/{name} of {child}")]
    Lookup {
        child: String,
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Why a child did or did not lead to a controller.
#[derive(Debug, Clone)]
pub enum Resolution<C> {
    Found(Arc<C>),
    /// No owner reference carries the controller flag.
    NoController,
    /// The referenced controller is not in the cache (usually already deleted).
    NotFound,
    /// An object with the referenced name exists but has another kind or group.
    Mismatch { kind: String, group: String },
}

impl<C> Resolution<C> {
    pub fn found(self) -> Option<Arc<C>> {
        match self {
            Resolution::Found(c) => Some(c),
            _ => None,
        }
    }
}

/// Resolve the controller of `child` through `lookup(namespace, name)`,
/// verifying that the fetched object's kind and group match the reference.
pub fn resolve<K, C, F>(child: &K, lookup: &F) -> Result<Resolution<C>, ResolveError>
where
    K: Resource,
    C: TypeIdentity,
    F: Fn(&str, &str) -> Result<Arc<C>, StoreError> + ?Sized,
{
    let Some(owner) = controller_of(child) else {
        return Ok(Resolution::NoController);
    };
    let meta = child.meta();
    let namespace = meta.namespace.as_deref().unwrap_or_default();
    let child_desc = || format!("{}/{}", namespace, meta.name.as_deref().unwrap_or_default());

    let (group, _version) = parse_group_version(&owner.api_version).map_err(|source| ResolveError::GroupVersion {
        child: child_desc(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        source,
    })?;

    let candidate = match lookup(namespace, &owner.name) {
        Ok(c) => c,
        Err(e) if e.is_not_found() => {
            debug!(controller = %format!("{}/{}", namespace, owner.name), child = %child_desc(), "controller not found, ignore");
            return Ok(Resolution::NotFound);
        }
        Err(source) => {
            return Err(ResolveError::Lookup {
                child: child_desc(),
                namespace: namespace.to_string(),
                name: owner.name.clone(),
                source,
            })
        }
    };

    let kind = candidate.type_kind().unwrap_or_default();
    let actual_group = candidate.type_group().unwrap_or_default();
    if kind == owner.kind && actual_group == group {
        Ok(Resolution::Found(candidate))
    } else {
        debug!(
            child = %child_desc(),
            expected = %format!("{}/{}", group, owner.kind),
            actual = %format!("{}/{}", actual_group, kind),
            "controller kind mismatch, ignore"
        );
        Ok(Resolution::Mismatch { kind: kind.to_string(), group: actual_group.to_string() })
    }
}

/// [`resolve`] collapsed to "controller or nothing".
pub fn resolve_controller<K, C, F>(child: &K, lookup: &F) -> Result<Option<Arc<C>>, ResolveError>
where
    K: Resource,
    C: TypeIdentity,
    F: Fn(&str, &str) -> Result<Arc<C>, StoreError> + ?Sized,
{
    resolve(child, lookup).map(Resolution::found)
}
