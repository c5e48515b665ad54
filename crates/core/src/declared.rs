use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::fields::FieldSet;
use crate::{keys, Json, ObjectRef, ResourceId, ScopeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Normal,
    /// Never prune, even after removal from the declared set.
    PreventDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Management {
    #[default]
    Enabled,
    /// Do not manage content; release the object without deleting it.
    Disabled,
    /// Client-side only; never sent to the cluster.
    LocalConfig,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest missing {0}")]
    Missing(&'static str),
    #[error("invalid depends-on reference {reference:?} on {id}")]
    BadDependency { id: String, reference: String },
}

/// Well-known kinds that never take a namespace, so a default namespace is not
/// filled into them.
const CLUSTER_SCOPED_KINDS: [&str; 8] = [
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "ValidatingWebhookConfiguration",
];

/// One resource of a declared set, produced fresh for every reconcile cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredResource {
    pub id: ResourceId,
    /// Desired object as declared (apiVersion, kind, metadata, spec...).
    pub payload: Json,
    pub depends_on: SmallVec<[ObjectRef; 2]>,
    pub lifecycle: Lifecycle,
    pub management: Management,
}

impl DeclaredResource {
    /// Decode a manifest, reading identity and the out-of-band directives from its
    /// annotations. `default_namespace` fills `metadata.namespace` when the manifest
    /// leaves it empty, except on well-known cluster-scoped kinds.
    pub fn from_manifest(mut payload: Json, default_namespace: Option<&str>) -> Result<Self, ManifestError> {
        if payload.get("apiVersion").and_then(|v| v.as_str()).is_none() {
            return Err(ManifestError::Missing("apiVersion"));
        }
        if payload.get("kind").and_then(|v| v.as_str()).is_none() {
            return Err(ManifestError::Missing("kind"));
        }
        if payload.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).is_none() {
            return Err(ManifestError::Missing("metadata.name"));
        }
        let cluster_scoped = payload["kind"].as_str().is_some_and(|k| CLUSTER_SCOPED_KINDS.contains(&k));
        if let Some(ns) = default_namespace.filter(|_| !cluster_scoped) {
            let has_ns = payload["metadata"].get("namespace").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty());
            if !has_ns {
                if let Some(meta) = payload.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    meta.insert("namespace".into(), Json::String(ns.to_string()));
                }
            }
        }
        let id = ResourceId::from_object(&payload).ok_or(ManifestError::Missing("metadata"))?;

        let annotation = |key: &str| -> Option<String> {
            payload["metadata"].get("annotations").and_then(|a| a.get(key)).and_then(|v| v.as_str()).map(str::to_string)
        };
        let mut depends_on = SmallVec::new();
        if let Some(raw) = annotation(keys::DEPENDS_ON) {
            for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                let r = ObjectRef::parse(part).ok_or_else(|| ManifestError::BadDependency {
                    id: id.to_string(),
                    reference: part.trim().to_string(),
                })?;
                depends_on.push(r);
            }
        }
        let lifecycle = match annotation(keys::LIFECYCLE_DELETION).as_deref() {
            Some(keys::LIFECYCLE_DETACH) => Lifecycle::PreventDeletion,
            _ => Lifecycle::Normal,
        };
        let management = if annotation(keys::LOCAL_CONFIG).as_deref() == Some("true") {
            Management::LocalConfig
        } else if annotation(keys::MANAGEMENT).as_deref() == Some(keys::MANAGEMENT_DISABLED) {
            Management::Disabled
        } else {
            Management::Enabled
        };
        Ok(Self { id, payload, depends_on, lifecycle, management })
    }

    pub fn fields(&self) -> FieldSet {
        FieldSet::from_payload(&self.payload)
    }

    pub fn is_enabled(&self) -> bool {
        self.management == Management::Enabled
    }
}

/// A resource as it currently exists on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveResource {
    raw: Json,
}

impl LiveResource {
    pub fn new(raw: Json) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Json {
        &self.raw
    }

    pub fn into_raw(self) -> Json {
        self.raw
    }

    pub fn id(&self) -> Option<ResourceId> {
        ResourceId::from_object(&self.raw)
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    /// Optimistic-concurrency token.
    pub fn resource_version(&self) -> Option<&str> {
        self.meta_str("resourceVersion")
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta_str("uid")
    }

    pub fn is_terminating(&self) -> bool {
        self.meta_str("deletionTimestamp").is_some()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("labels")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    /// Scope named by the manager annotation, if present and well-formed.
    pub fn manager(&self) -> Option<ScopeId> {
        self.annotation(keys::MANAGER).and_then(ScopeId::parse_manager)
    }

    pub fn declared_fields(&self) -> Option<FieldSet> {
        self.annotation(keys::DECLARED_FIELDS).and_then(FieldSet::from_annotation)
    }

    pub fn prevents_deletion(&self) -> bool {
        self.annotation(keys::LIFECYCLE_DELETION) == Some(keys::LIFECYCLE_DETACH)
    }

    /// Depends-on references stamped on the live object; unparseable entries are skipped.
    pub fn depends_on(&self) -> Vec<ObjectRef> {
        self.annotation(keys::DEPENDS_ON)
            .map(|raw| raw.split(',').filter_map(ObjectRef::parse).collect())
            .unwrap_or_default()
    }
}
