//! conform kubehub: one polymorphic operation set {get, list, create, update, delete, watch}
//! over arbitrary resource kinds, addressed by (group, version, kind).
//!
//! `KubeCluster` talks to a real API server through kube-rs dynamic objects;
//! `MemCluster` is an in-process cluster with the same optimistic-concurrency and
//! watch semantics, used by every test suite in the workspace.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use conform_core::{ClusterError, Gvk, Json, LiveResource, ObjectRef, ResourceId};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::histogram;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

mod mem;
pub mod retry;

pub use mem::{MemCluster, Mutation, MutationOp};
pub use retry::{retry, Backoff};

/// Watch notifications, mirroring the list+watch protocol: `Restarted` carries a
/// complete fresh list and replaces whatever the consumer knew before.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(LiveResource),
    Deleted(LiveResource),
    Restarted(Vec<LiveResource>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// Capability interface over the cluster API. Every call may block on network I/O.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<Option<LiveResource>, ClusterError>;

    async fn list(&self, gvk: &Gvk) -> Result<Vec<LiveResource>, ClusterError>;

    /// Whether an object matching a version-less reference exists.
    async fn exists(&self, reference: &ObjectRef) -> Result<bool, ClusterError>;

    async fn create(&self, obj: &Json) -> Result<LiveResource, ClusterError>;

    /// Replace the object. If `metadata.resourceVersion` is set the server rejects the
    /// write with `Conflict` when it no longer matches.
    async fn update(&self, obj: &Json) -> Result<LiveResource, ClusterError>;

    /// Delete, optionally only if the live resourceVersion still equals `precondition`.
    async fn delete(&self, id: &ResourceId, precondition: Option<&str>) -> Result<(), ClusterError>;

    /// Long-lived list+watch of every object of `gvk`. The first item is `Restarted`.
    async fn watch(&self, gvk: &Gvk) -> Result<WatchStream, ClusterError>;
}

static KUBE_CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client for the current kubeconfig/in-cluster context.
pub async fn get_kube_client() -> Result<Client, ClusterError> {
    if let Some(c) = KUBE_CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.map_err(map_kube_err)?;
    Ok(KUBE_CLIENT.get_or_init(|| client).clone())
}

/// `ClusterClient` over kube-rs dynamic objects. Api resources are resolved by
/// discovery once per kind and cached.
pub struct KubeCluster {
    client: Client,
    resources: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self, ClusterError> {
        Ok(Self::new(get_kube_client().await?))
    }

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(hit) = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned() {
            return Ok(hit);
        }
        let kgvk = GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() };
        let (ar, caps) = discovery::pinned_kind(&self.client, &kgvk).await.map_err(|e| match map_kube_err(e) {
            ClusterError::NotFound(_) => ClusterError::UnknownKind(gvk.key()),
            other => other,
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %gvk, plural = %ar.plural, namespaced, "resolved api resource");
        self.resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(gvk.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, id: &ResourceId) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resolve(&id.gvk()).await?;
        Ok(if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(ClusterError::Invalid(format!("namespace required for namespaced kind {}", id.kind))),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Shape a dynamic object into a live resource; list items may omit apiVersion/kind.
fn to_live(obj: &DynamicObject, gvk: &Gvk) -> Result<LiveResource, ClusterError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClusterError::Other(format!("serializing DynamicObject: {}", e)))?;
    strip_managed_fields(&mut raw);
    if let Some(top) = raw.as_object_mut() {
        top.entry("apiVersion").or_insert_with(|| Json::String(gvk.api_version()));
        top.entry("kind").or_insert_with(|| Json::String(gvk.kind.clone()));
    }
    Ok(LiveResource::new(raw))
}

fn to_dynamic(obj: &Json) -> Result<(DynamicObject, ResourceId), ClusterError> {
    let id = ResourceId::from_object(obj).ok_or_else(|| ClusterError::Invalid("object missing apiVersion/kind/metadata.name".into()))?;
    let dynamic: DynamicObject = serde_json::from_value(obj.clone()).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    Ok((dynamic, id))
}

/// Classify kube errors into retryable and terminal cluster errors.
pub fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound(resp.message),
            409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
            409 => ClusterError::Conflict(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            401 | 403 => ClusterError::Forbidden(resp.message),
            429 | 500 | 502 | 503 | 504 => ClusterError::Unavailable(resp.message),
            _ => ClusterError::Other(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        },
        kube::Error::Discovery(e) => ClusterError::UnknownKind(e.to_string()),
        kube::Error::SerdeError(e) => ClusterError::Other(e.to_string()),
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn observe(verb: &'static str, t0: Instant) {
    histogram!("conform_cluster_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<LiveResource>, ClusterError> {
        let t0 = Instant::now();
        let api = self.api_for(id).await?;
        let res = api.get_opt(&id.name).await.map_err(map_kube_err)?;
        observe("get", t0);
        res.map(|o| to_live(&o, &id.gvk())).transpose()
    }

    async fn list(&self, gvk: &Gvk) -> Result<Vec<LiveResource>, ClusterError> {
        let t0 = Instant::now();
        let (ar, _) = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api.list(&ListParams::default()).await.map_err(map_kube_err)?;
        observe("list", t0);
        list.items.iter().map(|o| to_live(o, gvk)).collect()
    }

    async fn exists(&self, reference: &ObjectRef) -> Result<bool, ClusterError> {
        let group = discovery::group(&self.client, &reference.group).await.map_err(map_kube_err)?;
        let Some((ar, caps)) = group.recommended_kind(&reference.kind) else {
            return Ok(false);
        };
        let api: Api<DynamicObject> = match (&reference.namespace, caps.scope) {
            (Some(ns), Scope::Namespaced) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (None, Scope::Cluster) => Api::all_with(self.client.clone(), &ar),
            _ => return Ok(false),
        };
        Ok(api.get_opt(&reference.name).await.map_err(map_kube_err)?.is_some())
    }

    async fn create(&self, obj: &Json) -> Result<LiveResource, ClusterError> {
        let t0 = Instant::now();
        let (dynamic, id) = to_dynamic(obj)?;
        let api = self.api_for(&id).await?;
        let created = api.create(&PostParams::default(), &dynamic).await.map_err(map_kube_err)?;
        observe("create", t0);
        to_live(&created, &id.gvk())
    }

    async fn update(&self, obj: &Json) -> Result<LiveResource, ClusterError> {
        let t0 = Instant::now();
        let (dynamic, id) = to_dynamic(obj)?;
        let api = self.api_for(&id).await?;
        let updated = api.replace(&id.name, &PostParams::default(), &dynamic).await.map_err(map_kube_err)?;
        observe("update", t0);
        to_live(&updated, &id.gvk())
    }

    async fn delete(&self, id: &ResourceId, precondition: Option<&str>) -> Result<(), ClusterError> {
        let t0 = Instant::now();
        let api = self.api_for(id).await?;
        let dp = DeleteParams {
            preconditions: precondition.map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..DeleteParams::default()
        };
        api.delete(&id.name, &dp).await.map_err(map_kube_err)?;
        observe("delete", t0);
        Ok(())
    }

    async fn watch(&self, gvk: &Gvk) -> Result<WatchStream, ClusterError> {
        let (ar, _) = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let gvk = gvk.clone();
        info!(gvk = %gvk, "watcher started");
        let stream = watcher::watcher(api, watcher::Config::default()).map(move |ev| match ev {
            Ok(Event::Applied(o)) => to_live(&o, &gvk).map(WatchEvent::Applied),
            Ok(Event::Deleted(o)) => to_live(&o, &gvk).map(WatchEvent::Deleted),
            Ok(Event::Restarted(list)) => list
                .iter()
                .map(|o| to_live(o, &gvk))
                .collect::<Result<Vec<_>, _>>()
                .map(WatchEvent::Restarted),
            Err(e) => Err(ClusterError::Unavailable(e.to_string())),
        });
        Ok(stream.boxed())
    }
}
