//! conform applier: converge the cluster toward one scope's declared set.
//!
//! A cycle widens the inventory, applies enabled resources layer by layer, releases
//! disabled ones, prunes what left the set in reverse dependency order, and finally
//! records what the scope still owns. Per-resource failures are collected; they
//! never abort the cycle.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use conform_core::{
    ClusterError, DeclaredResource, ErrorCode, FieldSet, Gvk, LiveResource, Management, ResourceId, ScopeId, StatusError,
};
use conform_graph::{ApplyOrder, DependencyGraph, GraphError};
use conform_inventory::{Inventory, InventoryStore};
use conform_kubehub::{retry, Backoff, ClusterClient};
use conform_ownership::{conflict_error, Claim, Grant, OwnershipRegistry};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod merge;
mod prune;

pub use merge::{diff_summary, drifted_fields, merge_declared, object_for_create, strip_noisy, DiffSummary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub released: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Created,
    Updated,
    Deleted,
    Released,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Created => "created",
            Op::Updated => "updated",
            Op::Deleted => "deleted",
            Op::Released => "released",
        }
    }
}

/// What one apply cycle did.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Kinds of the resources that converged this cycle.
    pub applied_gvks: BTreeSet<Gvk>,
    pub errors: Vec<StatusError>,
    /// Keyed by kind (`v1/ConfigMap`).
    pub counts: BTreeMap<String, OpCounts>,
    /// Resources that are live, ours, and match their declaration.
    pub applied: BTreeSet<ResourceId>,
    /// Inventory as persisted at the end of the cycle; `None` if it could not be written.
    pub inventory: Option<Inventory>,
}

impl ApplyOutcome {
    fn record(&mut self, id: &ResourceId, op: Op) {
        let kind = id.gvk().key();
        let c = self.counts.entry(kind.clone()).or_default();
        match op {
            Op::Created => c.created += 1,
            Op::Updated => c.updated += 1,
            Op::Deleted => c.deleted += 1,
            Op::Released => c.released += 1,
        }
        counter!("conform_apply_operations_total", 1u64, "kind" => kind, "op" => op.as_str());
    }

    pub fn total(&self) -> OpCounts {
        self.counts.values().fold(OpCounts::default(), |mut acc, c| {
            acc.created += c.created;
            acc.updated += c.updated;
            acc.deleted += c.deleted;
            acc.released += c.released;
            acc
        })
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converged {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergeFailure {
    /// Another scope owns the live object; nothing was written.
    Conflict { owner: ScopeId },
    /// The cluster refused the write, or retries ran out.
    Rejected(ClusterError),
}

pub struct Applier {
    client: Arc<dyn ClusterClient>,
    registry: OwnershipRegistry,
    backoff: Backoff,
}

impl Applier {
    pub fn new(client: Arc<dyn ClusterClient>, registry: OwnershipRegistry, backoff: Backoff) -> Self {
        Self { client, registry, backoff }
    }

    pub fn scope(&self) -> &ScopeId {
        self.registry.scope()
    }

    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }

    /// Whether this scope may manage `id` at all. Namespace scopes are confined to
    /// their namespace and may not declare cluster-scoped objects.
    pub fn in_scope(&self, id: &ResourceId) -> bool {
        match self.scope().namespace() {
            None => true,
            Some(ns) => id.namespace.as_deref() == Some(ns) && !id.is_namespace() && !id.is_crd(),
        }
    }

    /// Run one cycle. `previous` is the inventory loaded at the start of the cycle.
    pub async fn apply(&self, declared: &[DeclaredResource], previous: &Inventory, store: &InventoryStore) -> ApplyOutcome {
        let t0 = Instant::now();
        let mut out = ApplyOutcome::default();

        let declared: Vec<&DeclaredResource> =
            declared.iter().filter(|d| d.management != Management::LocalConfig).collect();
        let declared_ids: BTreeSet<ResourceId> = declared.iter().map(|d| d.id.clone()).collect();
        let mut enabled: Vec<&DeclaredResource> = Vec::new();
        let mut disabled: Vec<&DeclaredResource> = Vec::new();
        for d in &declared {
            if !self.in_scope(&d.id) {
                out.errors.push(StatusError::for_resource(
                    ErrorCode::ScopeViolation,
                    &d.id,
                    format!("{} is outside scope {}", d.id, self.scope()),
                ));
                continue;
            }
            match d.management {
                Management::Enabled => enabled.push(*d),
                Management::Disabled => disabled.push(*d),
                Management::LocalConfig => {}
            }
        }
        let to_prune: Vec<ResourceId> = previous.entries.difference(&declared_ids).cloned().collect();

        let graph = DependencyGraph::build(enabled.iter().copied());
        let order = graph.order();

        // Record intent before the first mutation so a crash never orphans a create.
        // Ids that cannot be ordered, or whose object another scope holds, are never
        // written this cycle and stay out.
        let fresh: Vec<&ResourceId> = order.iter().filter(|id| !previous.contains(id)).collect();
        let held = join_all(fresh.iter().map(|id| async move { (*id, self.held_elsewhere(id).await) })).await;
        let mut widened = previous.entries.clone();
        widened.extend(held.into_iter().filter(|(_, h)| !h).map(|(id, _)| id.clone()));
        if widened != previous.entries {
            if let Err(e) = store.save(&widened).await {
                warn!(scope = %self.scope(), error = %e, "inventory widening failed; skipping cycle");
                out.errors.push(e.to_status());
                return out;
            }
        }

        let mut failed: BTreeSet<ResourceId> = BTreeSet::new();
        let mut conflicted: BTreeSet<ResourceId> = BTreeSet::new();
        self.apply_layers(&enabled, &graph, &order, &mut out, &mut failed, &mut conflicted).await;

        let mut keep: BTreeSet<ResourceId> = BTreeSet::new();
        for d in &disabled {
            match retry(&self.backoff, "release", || self.release_once(&d.id)).await {
                Ok(true) => out.record(&d.id, Op::Released),
                Ok(false) => {}
                Err(e) => {
                    out.errors.push(StatusError::for_resource(
                        ErrorCode::Apply,
                        &d.id,
                        format!("releasing {}: {}", d.id, e),
                    ));
                    keep.insert(d.id.clone());
                }
            }
        }

        keep.extend(self.prune(&to_prune, &declared, &mut out).await);

        // Failures nobody else holds stay recorded, so an identical next cycle
        // neither widens nor narrows again.
        let mut next: BTreeSet<ResourceId> = out.applied.clone();
        for id in &widened {
            let unresolved = failed.contains(id) && !conflicted.contains(id);
            if unresolved || keep.contains(id) || (declared_ids.contains(id) && !self.in_scope(id)) {
                next.insert(id.clone());
            }
        }
        match store.save(&next).await {
            Ok(inv) => out.inventory = Some(inv),
            Err(e) => out.errors.push(e.to_status()),
        }

        out.applied_gvks = out.applied.iter().map(ResourceId::gvk).collect();
        let total = out.total();
        histogram!("conform_apply_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            scope = %self.scope(),
            applied = out.applied.len(),
            created = total.created,
            updated = total.updated,
            deleted = total.deleted,
            released = total.released,
            errors = out.errors.len(),
            took_ms = %t0.elapsed().as_millis(),
            "apply cycle finished"
        );
        out
    }

    /// Apply enabled resources in graph layers: layers run in order, members of a
    /// layer concurrently. Anything whose prerequisite did not converge is skipped.
    async fn apply_layers(
        &self,
        enabled: &[&DeclaredResource],
        graph: &DependencyGraph,
        order: &ApplyOrder,
        out: &mut ApplyOutcome,
        failed: &mut BTreeSet<ResourceId>,
        conflicted: &mut BTreeSet<ResourceId>,
    ) {
        for e in order.errors() {
            out.errors.push(e.to_status());
        }
        failed.extend(order.excluded());
        let by_id: BTreeMap<&ResourceId, &DeclaredResource> = enabled.iter().map(|d| (&d.id, *d)).collect();

        for layer in &order.layers {
            let mut ready: Vec<&DeclaredResource> = Vec::with_capacity(layer.len());
            for id in layer {
                let Some(&decl) = by_id.get(id) else { continue };
                match self.check_prerequisites(graph, id, failed).await {
                    Ok(()) => ready.push(decl),
                    Err(status) => {
                        debug!(id = %id, error = %status, "skipping resource");
                        out.errors.push(status);
                        failed.insert(id.clone());
                    }
                }
            }
            let results = join_all(ready.iter().map(|d| async move { (*d, self.converge(d).await) })).await;
            for (decl, res) in results {
                match res {
                    Ok(c) => {
                        match c {
                            Converged::Created => out.record(&decl.id, Op::Created),
                            Converged::Updated => out.record(&decl.id, Op::Updated),
                            Converged::Unchanged => {}
                        }
                        out.applied.insert(decl.id.clone());
                    }
                    Err(ConvergeFailure::Conflict { owner }) => {
                        out.errors.push(conflict_error(&decl.id, self.scope(), &owner));
                        failed.insert(decl.id.clone());
                        conflicted.insert(decl.id.clone());
                    }
                    Err(ConvergeFailure::Rejected(e)) => {
                        warn!(id = %decl.id, error = %e, "apply rejected");
                        out.errors.push(StatusError::for_resource(ErrorCode::Apply, &decl.id, format!("applying {}: {}", decl.id, e)));
                        failed.insert(decl.id.clone());
                    }
                }
            }
        }
    }

    async fn check_prerequisites(
        &self,
        graph: &DependencyGraph,
        id: &ResourceId,
        failed: &BTreeSet<ResourceId>,
    ) -> Result<(), StatusError> {
        if let Some(on) = graph.prerequisites(id).into_iter().find(|p| failed.contains(p)) {
            return Err(GraphError::PrerequisiteFailed { id: id.clone(), on }.to_status());
        }
        for reference in graph.external_prerequisites(id) {
            match retry(&self.backoff, "exists", || self.client.exists(reference)).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(GraphError::MissingPrerequisite { id: id.clone(), reference: reference.clone() }.to_status())
                }
                Err(e) => {
                    return Err(StatusError::for_resource(
                        ErrorCode::DependencyBlocked,
                        id,
                        format!("{} depends on {}, which could not be checked: {}", id, reference, e),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Bring one resource to its declared state, honouring ownership. Stale reads
    /// and create races are retried from a fresh get.
    pub async fn converge(&self, decl: &DeclaredResource) -> Result<Converged, ConvergeFailure> {
        let fields = decl.fields();
        match retry(&self.backoff, "converge", || self.converge_once(decl, &fields)).await {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(owner)) => Err(ConvergeFailure::Conflict { owner }),
            Err(e) => Err(ConvergeFailure::Rejected(e)),
        }
    }

    async fn converge_once(&self, decl: &DeclaredResource, fields: &FieldSet) -> Result<Result<Converged, ScopeId>, ClusterError> {
        let live = self.client.get(&decl.id).await?;
        match self.registry.claim(live.as_ref()) {
            Claim::Denied { owner } => return Ok(Err(owner)),
            Claim::Granted(Grant::Preempted { previous }) => {
                info!(id = %decl.id, scope = %self.scope(), previous = %previous, "taking over from namespace scope");
            }
            Claim::Granted(_) => {}
        }
        let Some(live) = live else {
            let obj = object_for_create(decl, fields, &self.registry);
            self.client.create(&obj).await?;
            debug!(id = %decl.id, "created");
            return Ok(Ok(Converged::Created));
        };
        let previous = if self.registry.owns(&live) { live.declared_fields() } else { None };
        let merged = merge_declared(&live, decl, previous.as_ref(), fields, &self.registry);
        if &merged == live.raw() {
            return Ok(Ok(Converged::Unchanged));
        }
        let summary = diff_summary(&strip_noisy(merged.clone()), &strip_noisy(live.raw().clone()));
        self.client.update(&merged).await?;
        debug!(id = %decl.id, adds = summary.adds, updates = summary.updates, removes = summary.removes, "updated");
        Ok(Ok(Converged::Updated))
    }

    /// Strip this scope's stamp from the live object, if it is ours. Returns whether
    /// an update was written.
    async fn release_once(&self, id: &ResourceId) -> Result<bool, ClusterError> {
        let Some(live) = self.client.get(id).await? else { return Ok(false) };
        if !self.registry.owns(&live) {
            return Ok(false);
        }
        let mut raw = live.into_raw();
        if !self.registry.release(&mut raw) {
            return Ok(false);
        }
        self.client.update(&raw).await?;
        debug!(id = %id, "released");
        Ok(true)
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<LiveResource>, ClusterError> {
        retry(&self.backoff, "get", || self.client.get(id)).await
    }

    /// Whether another scope holds the live object. Unreadable counts as not held.
    async fn held_elsewhere(&self, id: &ResourceId) -> bool {
        match self.get(id).await {
            Ok(live) => self.registry.held_elsewhere(live.as_ref()),
            Err(e) => {
                debug!(id = %id, error = %e, "ownership pre-check failed");
                false
            }
        }
    }
}
