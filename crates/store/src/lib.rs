//! conform store: the last-declared cache shared by the reconcile loop and the
//! remediator, and the per-resource coalescing queue the remediator drains.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use conform_core::{DeclaredResource, Delta, FieldSet, Gvk, ResourceId};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

/// Coalescing queue keyed by ResourceId with FIFO order and fixed capacity.
/// A newer delta for a queued id replaces the older one in place.
pub struct Coalescer {
    map: FxHashMap<ResourceId, Delta>,
    order: VecDeque<ResourceId>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: Delta) {
        if !self.map.contains_key(&d.id) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    counter!("conform_coalescer_dropped_total", 1u64);
                }
            }
            self.order.push_back(d.id.clone());
        }
        self.map.insert(d.id.clone(), d);
    }

    /// Drain all currently coalesced deltas in first-seen order.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&id) {
                out.push(d);
            }
        }
        out
    }
}

/// What a scope last declared for one resource, with the fingerprint it stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredEntry {
    pub resource: DeclaredResource,
    pub fields: FieldSet,
}

impl DeclaredEntry {
    pub fn new(resource: DeclaredResource) -> Self {
        let fields = resource.fields();
        Self { resource, fields }
    }
}

/// Immutable view of the last-declared set. Readers hold an `Arc` to a complete
/// snapshot; a newer one never mutates it.
#[derive(Debug, Default)]
pub struct DeclaredSnapshot {
    pub epoch: u64,
    pub revision: Option<String>,
    entries: FxHashMap<ResourceId, Arc<DeclaredEntry>>,
}

impl DeclaredSnapshot {
    pub fn get(&self, id: &ResourceId) -> Option<&Arc<DeclaredEntry>> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in stable order.
    pub fn ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resource kinds present in the snapshot.
    pub fn gvks(&self) -> BTreeSet<Gvk> {
        self.entries.keys().map(ResourceId::gvk).collect()
    }
}

/// Accumulates entries for the next snapshot.
#[derive(Default)]
pub struct SnapshotBuilder {
    revision: Option<String>,
    entries: FxHashMap<ResourceId, Arc<DeclaredEntry>>,
}

impl SnapshotBuilder {
    pub fn new(revision: impl Into<String>) -> Self {
        Self { revision: Some(revision.into()), entries: FxHashMap::default() }
    }

    /// Start from the entries of an existing snapshot (shared, not copied).
    pub fn from_snapshot(snap: &DeclaredSnapshot, revision: impl Into<String>) -> Self {
        Self { revision: Some(revision.into()), entries: snap.entries.clone() }
    }

    pub fn insert(&mut self, entry: DeclaredEntry) {
        self.entries.insert(entry.resource.id.clone(), Arc::new(entry));
    }

    /// Carry an existing entry over unchanged.
    pub fn keep(&mut self, entry: Arc<DeclaredEntry>) {
        self.entries.insert(entry.resource.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &ResourceId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn freeze(self, epoch: u64) -> DeclaredSnapshot {
        DeclaredSnapshot { epoch, revision: self.revision, entries: self.entries }
    }
}

/// Writer side of the last-declared cache. Publishing is a single pointer swap
/// followed by an epoch bump on the watch channel.
pub struct DeclaredCache {
    snap: Arc<ArcSwap<DeclaredSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for DeclaredCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeclaredCache {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: Arc::new(ArcSwap::from_pointee(DeclaredSnapshot::default())), epoch_tx }
    }

    pub fn handle(&self) -> CacheHandle {
        CacheHandle { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_tx.subscribe() }
    }

    pub fn current(&self) -> Arc<DeclaredSnapshot> {
        self.snap.load_full()
    }

    /// Replace the snapshot; returns the new epoch.
    pub fn publish(&self, builder: SnapshotBuilder) -> u64 {
        let epoch = self.snap.load().epoch.saturating_add(1);
        let next = builder.freeze(epoch);
        debug!(epoch, entries = next.len(), revision = ?next.revision, "declared cache swapped");
        self.snap.store(Arc::new(next));
        self.epoch_tx.send_replace(epoch);
        epoch
    }
}

/// Reader side: cheap to clone, lock-free reads.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<DeclaredSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<DeclaredSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}
