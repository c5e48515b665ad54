//! In-memory cluster with resource versions, optimistic concurrency, watch fan-out,
//! fault injection and a journal of every mutation it accepted.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use conform_core::{keys, ClusterError, Gvk, Json, LiveResource, ObjectRef, ResourceId};
use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{ClusterClient, WatchEvent, WatchStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

/// One accepted write, in acceptance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub seq: u64,
    pub op: MutationOp,
    pub id: ResourceId,
    /// Manager annotation on the object after the write (before it, for deletes).
    pub manager: Option<String>,
}

enum Fault {
    /// Every write to the object fails with this error.
    Reject(ClusterError),
    /// The next `remaining` calls of any verb on the object fail.
    Transient { remaining: u32, err: ClusterError },
}

type WatchTx = mpsc::UnboundedSender<Result<WatchEvent, ClusterError>>;

#[derive(Default)]
struct MemState {
    objects: BTreeMap<ResourceId, Json>,
    rv: u64,
    journal: Vec<Mutation>,
    faults: FxHashMap<ResourceId, Fault>,
    watchers: FxHashMap<Gvk, Vec<WatchTx>>,
}

impl MemState {
    fn check_fault(&mut self, id: &ResourceId, write: bool) -> Result<(), ClusterError> {
        match self.faults.get_mut(id) {
            Some(Fault::Reject(err)) if write => Err(err.clone()),
            Some(Fault::Transient { remaining, err }) if *remaining > 0 => {
                *remaining -= 1;
                Err(err.clone())
            }
            _ => Ok(()),
        }
    }

    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn record(&mut self, op: MutationOp, id: &ResourceId, obj: &Json) {
        let manager = obj["metadata"]
            .get("annotations")
            .and_then(|a| a.get(keys::MANAGER))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let seq = self.journal.len() as u64 + 1;
        self.journal.push(Mutation { seq, op, id: id.clone(), manager });
    }

    fn notify(&mut self, gvk: &Gvk, ev: WatchEvent) {
        if let Some(txs) = self.watchers.get_mut(gvk) {
            txs.retain(|tx| tx.send(Ok(ev.clone())).is_ok());
        }
    }
}

/// In-process `ClusterClient`. Cheap to construct; share it behind an `Arc`.
#[derive(Default)]
pub struct MemCluster {
    state: Mutex<MemState>,
}

fn meta_mut(obj: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    if !obj.get("metadata").is_some_and(Json::is_object) {
        obj.as_object_mut()?.insert("metadata".into(), Json::Object(Default::default()));
    }
    obj.get_mut("metadata")?.as_object_mut()
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every accepted write so far.
    pub fn journal(&self) -> Vec<Mutation> {
        self.lock().journal.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().journal.len()
    }

    /// Current raw object, bypassing faults.
    pub fn peek(&self, id: &ResourceId) -> Option<Json> {
        self.lock().objects.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Make every write to `id` fail with `err` until cleared.
    pub fn reject_writes(&self, id: &ResourceId, err: ClusterError) {
        self.lock().faults.insert(id.clone(), Fault::Reject(err));
    }

    /// Fail the next `n` calls touching `id` with `err`.
    pub fn fail_next(&self, id: &ResourceId, n: u32, err: ClusterError) {
        self.lock().faults.insert(id.clone(), Fault::Transient { remaining: n, err });
    }

    pub fn clear_faults(&self, id: &ResourceId) {
        self.lock().faults.remove(id);
    }

    /// Out-of-band edit by some other actor: applies `f` and writes unconditionally.
    pub fn edit(&self, id: &ResourceId, f: impl FnOnce(&mut Json)) -> Option<LiveResource> {
        let mut st = self.lock();
        let mut obj = st.objects.get(id)?.clone();
        f(&mut obj);
        let rv = st.next_rv();
        if let Some(meta) = meta_mut(&mut obj) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        st.objects.insert(id.clone(), obj.clone());
        st.record(MutationOp::Update, id, &obj);
        st.notify(&id.gvk(), WatchEvent::Applied(LiveResource::new(obj.clone())));
        Some(LiveResource::new(obj))
    }

    /// Sever every open watch on `gvk` with an error, as a server-side reset would.
    pub fn break_watches(&self, gvk: &Gvk) {
        let mut st = self.lock();
        if let Some(txs) = st.watchers.remove(gvk) {
            for tx in txs {
                let _ = tx.send(Err(ClusterError::Unavailable("watch stream reset".into())));
            }
        }
    }

    pub fn watcher_count(&self, gvk: &Gvk) -> usize {
        let mut st = self.lock();
        match st.watchers.get_mut(gvk) {
            Some(txs) => {
                txs.retain(|tx| !tx.is_closed());
                txs.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl ClusterClient for MemCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<LiveResource>, ClusterError> {
        let mut st = self.lock();
        st.check_fault(id, false)?;
        Ok(st.objects.get(id).cloned().map(LiveResource::new))
    }

    async fn list(&self, gvk: &Gvk) -> Result<Vec<LiveResource>, ClusterError> {
        let st = self.lock();
        Ok(st.objects.iter().filter(|(id, _)| id.gvk() == *gvk).map(|(_, o)| LiveResource::new(o.clone())).collect())
    }

    async fn exists(&self, reference: &ObjectRef) -> Result<bool, ClusterError> {
        Ok(self.lock().objects.keys().any(|id| reference.matches(id)))
    }

    async fn create(&self, obj: &Json) -> Result<LiveResource, ClusterError> {
        let id = ResourceId::from_object(obj).ok_or_else(|| ClusterError::Invalid("object missing apiVersion/kind/metadata.name".into()))?;
        let mut st = self.lock();
        st.check_fault(&id, true)?;
        if st.objects.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(id.to_string()));
        }
        let mut stored = obj.clone();
        let rv = st.next_rv();
        let meta = meta_mut(&mut stored).ok_or_else(|| ClusterError::Invalid("object is not a map".into()))?;
        meta.insert("uid".into(), Json::String(Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".into(), Json::String(rv));
        meta.insert("generation".into(), Json::from(1));
        st.objects.insert(id.clone(), stored.clone());
        st.record(MutationOp::Create, &id, &stored);
        st.notify(&id.gvk(), WatchEvent::Applied(LiveResource::new(stored.clone())));
        Ok(LiveResource::new(stored))
    }

    async fn update(&self, obj: &Json) -> Result<LiveResource, ClusterError> {
        let id = ResourceId::from_object(obj).ok_or_else(|| ClusterError::Invalid("object missing apiVersion/kind/metadata.name".into()))?;
        let mut st = self.lock();
        st.check_fault(&id, true)?;
        let current = st.objects.get(&id).cloned().ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        let current = LiveResource::new(current);
        let sent_rv = obj["metadata"].get("resourceVersion").and_then(|v| v.as_str());
        if let Some(rv) = sent_rv {
            if Some(rv) != current.resource_version() {
                return Err(ClusterError::Conflict(format!(
                    "{}: resourceVersion {} is stale (live {})",
                    id,
                    rv,
                    current.resource_version().unwrap_or("-")
                )));
            }
        }
        let mut stored = obj.clone();
        let rv = st.next_rv();
        let generation = current.raw()["metadata"].get("generation").and_then(|g| g.as_i64()).unwrap_or(1);
        let meta = meta_mut(&mut stored).ok_or_else(|| ClusterError::Invalid("object is not a map".into()))?;
        if let Some(uid) = current.uid() {
            meta.insert("uid".into(), Json::String(uid.to_string()));
        }
        meta.insert("resourceVersion".into(), Json::String(rv));
        meta.insert("generation".into(), Json::from(generation + 1));
        st.objects.insert(id.clone(), stored.clone());
        st.record(MutationOp::Update, &id, &stored);
        st.notify(&id.gvk(), WatchEvent::Applied(LiveResource::new(stored.clone())));
        Ok(LiveResource::new(stored))
    }

    async fn delete(&self, id: &ResourceId, precondition: Option<&str>) -> Result<(), ClusterError> {
        let mut st = self.lock();
        st.check_fault(id, true)?;
        let current = st.objects.get(id).cloned().ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        let live = LiveResource::new(current);
        if let Some(rv) = precondition {
            if Some(rv) != live.resource_version() {
                return Err(ClusterError::Conflict(format!("{}: precondition resourceVersion {} failed", id, rv)));
            }
        }
        st.objects.remove(id);
        st.record(MutationOp::Delete, id, live.raw());
        st.notify(&id.gvk(), WatchEvent::Deleted(live));
        Ok(())
    }

    async fn watch(&self, gvk: &Gvk) -> Result<WatchStream, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.lock();
            let initial: Vec<LiveResource> = st
                .objects
                .iter()
                .filter(|(id, _)| id.gvk() == *gvk)
                .map(|(_, o)| LiveResource::new(o.clone()))
                .collect();
            let _ = tx.send(Ok(WatchEvent::Restarted(initial)));
            st.watchers.entry(gvk.clone()).or_default().push(tx);
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) });
        Ok(stream.boxed())
    }
}
