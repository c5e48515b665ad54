//! conform core types: resource identities, directives, ownership keys and errors.
//!
//! Every other crate in the workspace speaks in these types. Nothing here talks to
//! a cluster; live objects are carried as raw JSON and inspected through accessors.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

mod declared;
mod error;
mod fields;
pub mod keys;
mod scope;

pub use declared::{DeclaredResource, Lifecycle, LiveResource, Management, ManifestError};
pub use error::{ClusterError, ErrorCode, StatusError};
pub use fields::{get_path, is_element_segment, remove_path, segment_index, set_path, FieldPath, FieldSet};
pub use scope::{PriorityClass, ScopeId};

pub type Json = serde_json::Value;

pub mod prelude {
    pub use super::{
        ClusterError, DeclaredResource, Delta, DeltaKind, ErrorCode, FieldSet, Gvk, Json,
        Lifecycle, LiveResource, Management, ObjectRef, ResourceId, ScopeId, StatusError,
    };
}

/// Group/Version/Kind of a served resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` string (`v1`, `apps/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Compact key: `v1/ConfigMap` or `apps/v1/Deployment`.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(*group, *version, *kind)),
            _ => None,
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Immutable identity of a resource: (group, version, kind, namespace, name).
///
/// Ordering is (kind, namespace, name, group, version) so that sorted sets of ids
/// read the way operators scan them and layer ordering is stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(gvk: &Gvk, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Read identity from a raw object (`apiVersion`, `kind`, `metadata.name`, `metadata.namespace`).
    pub fn from_object(obj: &Json) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?;
        let kind = obj.get("kind")?.as_str()?;
        let meta = obj.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        Some(Self::new(&Gvk::from_api_version(api_version, kind), namespace, name))
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone())
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }

    pub fn is_crd(&self) -> bool {
        self.group == "apiextensions.k8s.io" && self.kind == "CustomResourceDefinition"
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.group.cmp(&other.group))
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/namespaces/{}/{}", self.gvk().key(), ns, self.name),
            None => write!(f, "{}/{}", self.gvk().key(), self.name),
        }
    }
}

/// Version-less reference used by depends-on annotations: (group, kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Parse `<group>/namespaces/<ns>/<Kind>/<name>` or `<group>/<Kind>/<name>`.
    /// The group segment is empty for core kinds (`/namespaces/ns/ConfigMap/cm`).
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let non_empty = |p: &&str| !p.is_empty();
        match parts.as_slice() {
            [group, "namespaces", ns, kind, name] if non_empty(ns) && non_empty(kind) && non_empty(name) => Some(Self {
                group: (*group).to_string(),
                kind: (*kind).to_string(),
                namespace: Some((*ns).to_string()),
                name: (*name).to_string(),
            }),
            [group, kind, name] if non_empty(kind) && non_empty(name) => Some(Self {
                group: (*group).to_string(),
                kind: (*kind).to_string(),
                namespace: None,
                name: (*name).to_string(),
            }),
            _ => None,
        }
    }

    pub fn matches(&self, id: &ResourceId) -> bool {
        self.group == id.group && self.kind == id.kind && self.namespace == id.namespace && self.name == id.name
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/namespaces/{}/{}/{}", self.group, ns, self.kind, self.name),
            None => write!(f, "{}/{}/{}", self.group, self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One observed change to a live object, keyed by identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub id: ResourceId,
    pub kind: DeltaKind,
    /// Raw object as observed (managedFields stripped); `null` for a delete
    /// inferred from a re-list.
    pub raw: Json,
}

impl Delta {
    pub fn applied(live: LiveResource) -> Option<Self> {
        let id = live.id()?;
        Some(Self { id, kind: DeltaKind::Applied, raw: live.into_raw() })
    }

    pub fn deleted(live: LiveResource) -> Option<Self> {
        let id = live.id()?;
        Some(Self { id, kind: DeltaKind::Deleted, raw: live.into_raw() })
    }

    /// A delete known only by identity: the object was missing from a re-list.
    pub fn vanished(id: ResourceId) -> Self {
        Self { id, kind: DeltaKind::Deleted, raw: Json::Null }
    }
}
