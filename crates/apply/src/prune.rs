//! Pruning: delete what the scope stopped declaring, dependents before their
//! prerequisites, re-checking ownership right before every delete.

use std::collections::{BTreeMap, BTreeSet};

use conform_core::{ClusterError, DeclaredResource, ErrorCode, LiveResource, ObjectRef, ResourceId, StatusError};
use conform_graph::{defined_kind, DependencyGraph};
use conform_kubehub::retry;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{Applier, ApplyOutcome, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pruned {
    Deleted,
    Released,
    Gone,
    NotOwned,
}

/// What the still-declared set needs to keep existing.
struct StillDeclared<'a> {
    refs: BTreeMap<ObjectRef, &'a ResourceId>,
    namespaces: BTreeMap<&'a str, &'a ResourceId>,
    kinds: BTreeMap<(String, String), &'a ResourceId>,
}

impl<'a> StillDeclared<'a> {
    fn new(declared: &[&'a DeclaredResource]) -> Self {
        let mut refs = BTreeMap::new();
        let mut namespaces = BTreeMap::new();
        let mut kinds = BTreeMap::new();
        for &d in declared {
            for r in &d.depends_on {
                refs.entry(r.clone()).or_insert(&d.id);
            }
            if let Some(ns) = d.id.namespace.as_deref() {
                namespaces.entry(ns).or_insert(&d.id);
            }
            kinds.entry((d.id.group.clone(), d.id.kind.clone())).or_insert(&d.id);
        }
        Self { refs, namespaces, kinds }
    }

    /// A declared object that still depends on `live`, explicitly or implicitly.
    fn needed_by(&self, id: &ResourceId, live: &LiveResource) -> Option<&'a ResourceId> {
        if let Some(d) = self.refs.get(&id.object_ref()) {
            return Some(*d);
        }
        if id.is_namespace() {
            if let Some(d) = self.namespaces.get(id.name.as_str()) {
                return Some(*d);
            }
        }
        if id.is_crd() {
            let defined = defined_kind(live.raw())?;
            return self.kinds.get(&defined).copied();
        }
        None
    }
}

fn prune_error(id: &ResourceId, e: &ClusterError) -> StatusError {
    StatusError::for_resource(ErrorCode::Prune, id, format!("pruning {}: {}", id, e))
}

impl Applier {
    /// Prune `to_prune`; returns the ids that must stay in the inventory because they
    /// were held back or failed.
    pub(crate) async fn prune(
        &self,
        to_prune: &[ResourceId],
        declared: &[&DeclaredResource],
        out: &mut ApplyOutcome,
    ) -> BTreeSet<ResourceId> {
        let mut keep = BTreeSet::new();
        if to_prune.is_empty() {
            return keep;
        }
        let still = StillDeclared::new(declared);
        let mut candidates: Vec<LiveResource> = Vec::new();
        for id in to_prune {
            let live = match self.get(id).await {
                Ok(Some(live)) => live,
                Ok(None) => {
                    debug!(id = %id, "already gone");
                    continue;
                }
                Err(e) => {
                    out.errors.push(prune_error(id, &e));
                    keep.insert(id.clone());
                    continue;
                }
            };
            if !self.registry.owns(&live) {
                debug!(id = %id, owner = ?live.manager(), "no longer ours; dropping from inventory");
                continue;
            }
            if let Some(dependent) = still.needed_by(id, &live) {
                out.errors.push(StatusError::for_resource(
                    ErrorCode::DependencyMismatch,
                    id,
                    format!("{} is no longer declared but {} still depends on it; not pruned", id, dependent),
                ));
                keep.insert(id.clone());
                continue;
            }
            if live.prevents_deletion() {
                match retry(&self.backoff, "abandon", || self.release_once(id)).await {
                    Ok(true) => {
                        info!(id = %id, "abandoned with deletion prevented");
                        out.record(id, Op::Released);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        out.errors.push(prune_error(id, &e));
                        keep.insert(id.clone());
                    }
                }
                continue;
            }
            candidates.push(live);
        }

        let graph = DependencyGraph::build(&candidates);
        let mut undeleted: BTreeSet<ResourceId> = BTreeSet::new();
        for layer in graph.order().deletion_layers() {
            let mut ready: Vec<ResourceId> = Vec::with_capacity(layer.len());
            for id in layer {
                if let Some(dep) = graph.dependents(&id).into_iter().find(|d| undeleted.contains(d)) {
                    out.errors.push(StatusError::for_resource(
                        ErrorCode::Prune,
                        &id,
                        format!("{} not pruned: its dependent {} was not deleted", id, dep),
                    ));
                    undeleted.insert(id);
                    continue;
                }
                ready.push(id);
            }
            let results = join_all(ready.iter().map(|id| async move {
                (id, retry(&self.backoff, "prune", || self.delete_once(id)).await)
            }))
            .await;
            for (id, res) in results {
                match res {
                    Ok(Pruned::Deleted) => out.record(id, Op::Deleted),
                    Ok(Pruned::Released) => out.record(id, Op::Released),
                    Ok(Pruned::Gone | Pruned::NotOwned) => {}
                    Err(e) => {
                        warn!(id = %id, error = %e, "prune failed");
                        out.errors.push(prune_error(id, &e));
                        undeleted.insert(id.clone());
                    }
                }
            }
        }
        keep.extend(undeleted);
        keep
    }

    /// Re-read, re-check ownership, and delete with the re-read's resourceVersion as
    /// precondition so an object adopted in between is never removed.
    async fn delete_once(&self, id: &ResourceId) -> Result<Pruned, ClusterError> {
        let Some(live) = self.client.get(id).await? else { return Ok(Pruned::Gone) };
        if !self.registry.owns(&live) {
            return Ok(Pruned::NotOwned);
        }
        if live.prevents_deletion() {
            let mut raw = live.into_raw();
            self.registry.release(&mut raw);
            self.client.update(&raw).await?;
            return Ok(Pruned::Released);
        }
        match self.client.delete(id, live.resource_version()).await {
            Ok(()) => {
                info!(id = %id, "pruned");
                Ok(Pruned::Deleted)
            }
            Err(ClusterError::NotFound(_)) => Ok(Pruned::Gone),
            Err(e) => Err(e),
        }
    }
}
