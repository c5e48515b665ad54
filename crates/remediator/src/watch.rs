//! Kind watches shared by every scope in the process, reference-counted by the
//! scopes whose declared sets contain the kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use conform_core::{Delta, Gvk, LiveResource, ResourceId, ScopeId};
use conform_kubehub::{retry, Backoff, ClusterClient, WatchEvent};
use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type DeltaTx = mpsc::UnboundedSender<Delta>;

struct KindWatch {
    scopes: BTreeSet<ScopeId>,
    /// resourceVersion last observed per identity; used to synthesize deletes after
    /// a re-list.
    known: BTreeMap<ResourceId, String>,
    task: Option<JoinHandle<()>>,
}

impl KindWatch {
    fn observe(&mut self, event: WatchEvent) -> Vec<Delta> {
        match event {
            WatchEvent::Applied(live) => {
                let Some(id) = live.id() else { return Vec::new() };
                self.known.insert(id, live.resource_version().unwrap_or_default().to_string());
                Delta::applied(live).into_iter().collect()
            }
            WatchEvent::Deleted(live) => {
                if let Some(id) = live.id() {
                    self.known.remove(&id);
                }
                Delta::deleted(live).into_iter().collect()
            }
            WatchEvent::Restarted(list) => {
                let fresh: BTreeMap<ResourceId, LiveResource> =
                    list.into_iter().filter_map(|l| Some((l.id()?, l))).collect();
                let mut out: Vec<Delta> = self
                    .known
                    .keys()
                    .filter(|id| !fresh.contains_key(*id))
                    .cloned()
                    .map(Delta::vanished)
                    .collect();
                self.known = fresh
                    .iter()
                    .map(|(id, l)| (id.clone(), l.resource_version().unwrap_or_default().to_string()))
                    .collect();
                out.extend(fresh.into_values().filter_map(Delta::applied));
                out
            }
        }
    }
}

#[derive(Default)]
struct State {
    kinds: FxHashMap<Gvk, KindWatch>,
    sinks: FxHashMap<ScopeId, DeltaTx>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct WatchRegistry {
    client: Arc<dyn ClusterClient>,
    backoff: Backoff,
    state: Arc<Mutex<State>>,
}

impl WatchRegistry {
    pub fn new(client: Arc<dyn ClusterClient>, backoff: Backoff) -> Self {
        Self { client, backoff, state: Arc::new(Mutex::new(State::default())) }
    }

    /// Route deltas for every kind `scope` declares into `tx`.
    pub fn attach(&self, scope: &ScopeId, tx: DeltaTx) {
        lock(&self.state).sinks.insert(scope.clone(), tx);
    }

    /// Drop the scope's sink and its interest in every kind.
    pub fn detach(&self, scope: &ScopeId) {
        self.set_kinds(scope, &BTreeSet::new());
        lock(&self.state).sinks.remove(scope);
    }

    /// Make `kinds` the exact set `scope` is interested in. Must run inside a tokio
    /// runtime: the first scope to want a kind starts its watch, the last one to
    /// drop it stops the watch.
    pub fn set_kinds(&self, scope: &ScopeId, kinds: &BTreeSet<Gvk>) {
        let mut st = lock(&self.state);
        let withdrawn: Vec<Gvk> = st
            .kinds
            .iter()
            .filter(|(gvk, w)| w.scopes.contains(scope) && !kinds.contains(*gvk))
            .map(|(gvk, _)| gvk.clone())
            .collect();
        for gvk in withdrawn {
            self.release(&mut st, scope, &gvk);
        }
        for gvk in kinds {
            self.acquire(&mut st, scope, gvk);
        }
    }

    fn acquire(&self, st: &mut State, scope: &ScopeId, gvk: &Gvk) {
        let State { kinds, sinks } = st;
        let w = kinds.entry(gvk.clone()).or_insert_with(|| KindWatch {
            scopes: BTreeSet::new(),
            known: BTreeMap::new(),
            task: None,
        });
        if !w.scopes.insert(scope.clone()) {
            return;
        }
        match &w.task {
            None => {
                info!(gvk = %gvk.key(), scope = %scope, "starting watch");
                w.task = Some(tokio::spawn(run_watch(
                    gvk.clone(),
                    Arc::clone(&self.client),
                    self.backoff.clone(),
                    Arc::clone(&self.state),
                )));
            }
            Some(_) => {
                debug!(gvk = %gvk.key(), scope = %scope, known = w.known.len(), "joining running watch");
                if let Some(tx) = sinks.get(scope) {
                    tokio::spawn(prime(gvk.clone(), Arc::clone(&self.client), self.backoff.clone(), tx.clone()));
                }
            }
        }
    }

    fn release(&self, st: &mut State, scope: &ScopeId, gvk: &Gvk) {
        let Some(w) = st.kinds.get_mut(gvk) else { return };
        w.scopes.remove(scope);
        if w.scopes.is_empty() {
            if let Some(task) = w.task.take() {
                task.abort();
            }
            st.kinds.remove(gvk);
            info!(gvk = %gvk.key(), "watch stopped; no scope declares this kind");
        }
    }

    /// Kinds currently watched, sorted.
    pub fn watched(&self) -> Vec<Gvk> {
        let mut v: Vec<Gvk> = lock(&self.state).kinds.keys().cloned().collect();
        v.sort();
        v
    }

    /// Number of scopes holding the watch on `gvk`.
    pub fn interest(&self, gvk: &Gvk) -> usize {
        lock(&self.state).kinds.get(gvk).map_or(0, |w| w.scopes.len())
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        for (_, w) in st.kinds.drain() {
            if let Some(task) = w.task {
                task.abort();
            }
        }
    }
}

/// Forward one kind's events to the interested scopes forever, re-listing with
/// backoff whenever the stream errors or ends.
async fn run_watch(gvk: Gvk, client: Arc<dyn ClusterClient>, backoff: Backoff, state: Arc<Mutex<State>>) {
    let mut failures = 0u32;
    loop {
        match client.watch(&gvk).await {
            Ok(mut stream) => {
                debug!(gvk = %gvk.key(), "watch opened");
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            failures = 0;
                            dispatch(&state, &gvk, event);
                        }
                        Err(e) => {
                            warn!(gvk = %gvk.key(), error = %e, "watch interrupted; re-listing");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(gvk = %gvk.key(), error = %e, "watch failed to start"),
        }
        failures = failures.saturating_add(1);
        counter!("conform_watch_restarts_total", 1u64, "gvk" => gvk.key());
        tokio::time::sleep(backoff.delay(failures)).await;
    }
}

/// Send a scope that joined a running watch the kind's current objects.
async fn prime(gvk: Gvk, client: Arc<dyn ClusterClient>, backoff: Backoff, tx: DeltaTx) {
    match retry(&backoff, "list", || client.list(&gvk)).await {
        Ok(list) => {
            for d in list.into_iter().filter_map(Delta::applied) {
                if tx.send(d).is_err() {
                    return;
                }
            }
        }
        Err(e) => warn!(gvk = %gvk.key(), error = %e, "listing for a joining scope failed"),
    }
}

fn dispatch(state: &Mutex<State>, gvk: &Gvk, event: WatchEvent) {
    let mut st = lock(state);
    let State { kinds, sinks } = &mut *st;
    let Some(w) = kinds.get_mut(gvk) else { return };
    let deltas = w.observe(event);
    for scope in &w.scopes {
        let Some(tx) = sinks.get(scope) else { continue };
        for d in &deltas {
            let _ = tx.send(d.clone());
        }
    }
}
