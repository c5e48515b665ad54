//! conform remediator: keeps one scope's managed objects at their last-declared
//! state between apply cycles.
//!
//! Watch deltas arrive through the shared [`WatchRegistry`], are coalesced per
//! object, and are evaluated on a short tick against the last-declared snapshot
//! the reconciler publishes. Each object moves through
//! `Watching -> DriftDetected -> Correcting -> Watching`, or parks in
//! `ConflictReported` while another scope holds it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use conform_apply::{drifted_fields, Applier, ConvergeFailure, Converged};
use conform_core::{Delta, DeltaKind, ErrorCode, LiveResource, ResourceId, ScopeId, StatusError};
use conform_kubehub::{Backoff, ClusterClient};
use conform_ownership::{conflict_error, ConflictPolicy, ConflictTracker, OwnershipRegistry, FLIP_THRESHOLD, FLIP_WINDOW};
use conform_store::{CacheHandle, Coalescer, DeclaredEntry, DeclaredSnapshot};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub mod watch;

pub use watch::{DeltaTx, WatchRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationState {
    Watching,
    DriftDetected,
    Correcting,
    /// Another scope holds the object (`owner`), or its stamp keeps being stripped
    /// (`None`). No corrections until an event shows this scope's stamp again.
    ConflictReported { owner: Option<ScopeId> },
}

#[derive(Debug, Clone)]
pub struct RemediatorConfig {
    /// How often coalesced deltas are evaluated.
    pub tick: Duration,
    pub queue_capacity: usize,
    pub flip_window: Duration,
    pub flip_threshold: usize,
    pub backoff: Backoff,
}

impl Default for RemediatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            queue_capacity: 4096,
            flip_window: FLIP_WINDOW,
            flip_threshold: FLIP_THRESHOLD,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    states: BTreeMap<ResourceId, RemediationState>,
    errors: BTreeMap<ResourceId, StatusError>,
}

/// Per-object remediation state and standing errors, shared with the status surface.
/// Every change to the standing errors bumps a watch channel.
#[derive(Debug, Clone)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerInner>>,
    changes: Arc<tokio::sync::watch::Sender<u64>>,
}

impl Default for Ledger {
    fn default() -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(0u64);
        Self { inner: Arc::default(), changes: Arc::new(tx) }
    }
}

impl Ledger {
    /// Fires whenever a standing error is raised, replaced or cleared.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, id: &ResourceId) -> Option<RemediationState> {
        self.lock().states.get(id).cloned()
    }

    /// Standing conflicts and failed corrections, ordered by resource.
    pub fn errors(&self) -> Vec<StatusError> {
        self.lock().errors.values().cloned().collect()
    }

    /// Like [`Ledger::errors`], restricted to objects `snapshot` still declares.
    pub fn errors_for(&self, snapshot: &DeclaredSnapshot) -> Vec<StatusError> {
        self.lock().errors.iter().filter(|(id, _)| snapshot.contains(id)).map(|(_, e)| e.clone()).collect()
    }

    pub fn conflicts(&self) -> Vec<ResourceId> {
        self.lock()
            .states
            .iter()
            .filter(|(_, s)| matches!(s, RemediationState::ConflictReported { .. }))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Move `id` to `to`; returns the previous state.
    fn transition(&self, id: &ResourceId, to: RemediationState) -> Option<RemediationState> {
        let prev = self.lock().states.insert(id.clone(), to.clone());
        if prev.as_ref() != Some(&to) {
            debug!(id = %id, from = ?prev, to = ?to, "remediation state");
        }
        prev
    }

    fn report(&self, id: &ResourceId, err: StatusError) {
        let prev = self.lock().errors.insert(id.clone(), err.clone());
        if prev.as_ref() != Some(&err) {
            self.bump();
        }
    }

    fn clear_error(&self, id: &ResourceId) {
        let removed = self.lock().errors.remove(id).is_some();
        if removed {
            self.bump();
        }
    }

    fn forget(&self, id: &ResourceId) {
        let removed = {
            let mut inner = self.lock();
            inner.states.remove(id);
            inner.errors.remove(id).is_some()
        };
        if removed {
            self.bump();
        }
    }
}

struct Remediator {
    scope: ScopeId,
    applier: Applier,
    cache: CacheHandle,
    tracker: ConflictTracker,
    ledger: Ledger,
}

impl Remediator {
    async fn evaluate(&mut self, delta: Delta) {
        let snapshot = self.cache.current();
        let Some(entry) = snapshot.get(&delta.id).cloned() else {
            self.tracker.clear(&delta.id);
            self.ledger.forget(&delta.id);
            return;
        };
        let id = delta.id;
        let parked = matches!(self.ledger.state(&id), Some(RemediationState::ConflictReported { .. }));
        match delta.kind {
            DeltaKind::Deleted => {
                if parked {
                    debug!(id = %id, "deleted while in conflict; leaving it to the next apply cycle");
                    return;
                }
                info!(id = %id, scope = %self.scope, "declared object deleted externally");
                self.ledger.transition(&id, RemediationState::DriftDetected);
                self.correct(&id, &entry).await;
            }
            DeltaKind::Applied => {
                let live = LiveResource::new(delta.raw);
                if live.is_terminating() {
                    return;
                }
                let owner = live.manager();
                let flapping = self.tracker.observe(&id, owner.as_ref(), Instant::now());
                match &owner {
                    Some(o) if *o != self.scope => {
                        self.conflict(&id, Some(o.clone()));
                        return;
                    }
                    // released by the other side; still not ours
                    None if parked => return,
                    None if flapping => {
                        self.conflict(&id, None);
                        return;
                    }
                    _ => {}
                }
                let drift = drifted_fields(&live, &entry.resource, &entry.fields);
                let stale_stamp = owner.is_none() || live.declared_fields().as_ref() != Some(&entry.fields);
                if drift.is_empty() && !stale_stamp {
                    self.settle(&id);
                    return;
                }
                debug!(id = %id, drifted = drift.len(), stale_stamp, "drift detected");
                self.ledger.transition(&id, RemediationState::DriftDetected);
                self.correct(&id, &entry).await;
            }
        }
    }

    async fn correct(&mut self, id: &ResourceId, entry: &DeclaredEntry) {
        self.ledger.transition(id, RemediationState::Correcting);
        match self.applier.converge(&entry.resource).await {
            Ok(outcome) => {
                if outcome != Converged::Unchanged {
                    counter!("conform_remediator_corrections_total", 1u64, "kind" => id.gvk().key());
                    info!(id = %id, outcome = ?outcome, "drift corrected");
                }
                self.settle(id);
            }
            Err(ConvergeFailure::Conflict { owner }) => self.conflict(id, Some(owner)),
            Err(ConvergeFailure::Rejected(e)) => {
                warn!(id = %id, error = %e, "drift correction failed");
                self.ledger.report(
                    id,
                    StatusError::for_resource(ErrorCode::Remediation, id, format!("correcting drift on {}: {}", id, e)),
                );
                self.ledger.transition(id, RemediationState::Watching);
            }
        }
    }

    fn conflict(&mut self, id: &ResourceId, owner: Option<ScopeId>) {
        let err = match &owner {
            Some(o) => conflict_error(id, &self.scope, o),
            None => StatusError::for_resource(
                ErrorCode::ManagementConflict,
                id,
                format!("the ownership stamp on {} keeps being removed; not correcting until it is restored", id),
            ),
        };
        let to = RemediationState::ConflictReported { owner: owner.clone() };
        if self.ledger.transition(id, to.clone()) != Some(to) {
            counter!("conform_remediator_conflicts_total", 1u64, "kind" => id.gvk().key());
            warn!(id = %id, scope = %self.scope, owner = ?owner, "management conflict; not correcting");
        }
        self.ledger.report(id, err);
    }

    fn settle(&mut self, id: &ResourceId) {
        if let Some(RemediationState::ConflictReported { .. }) = self.ledger.transition(id, RemediationState::Watching) {
            info!(id = %id, scope = %self.scope, "conflict cleared; object is ours again");
        }
        self.ledger.clear_error(id);
    }
}

/// Running remediator for one scope. Dropping the handle stops it too.
pub struct RemediatorHandle {
    scope: ScopeId,
    ledger: Ledger,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RemediatorHandle {
    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Stop processing, release the scope's watches and wait for the loop to exit.
    /// An in-flight correction finishes first.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}

/// Start the remediator for `registry`'s scope. Corrections never preempt another
/// scope, whatever the apply policy allows.
pub fn spawn(
    client: Arc<dyn ClusterClient>,
    registry: &OwnershipRegistry,
    cache: CacheHandle,
    watches: Arc<WatchRegistry>,
    config: RemediatorConfig,
) -> RemediatorHandle {
    let scope = registry.scope().clone();
    let policy = ConflictPolicy { root_preempts_namespace: false, ..registry.policy().clone() };
    let applier = Applier::new(client, OwnershipRegistry::new(scope.clone(), policy), config.backoff.clone());
    let ledger = Ledger::default();
    let mut rem = Remediator {
        scope: scope.clone(),
        applier,
        cache,
        tracker: ConflictTracker::new(config.flip_window, config.flip_threshold),
        ledger: ledger.clone(),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Delta>();
    watches.attach(&scope, tx);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task_scope = scope.clone();
    let task = tokio::spawn(async move {
        let mut queue = Coalescer::with_capacity(config.queue_capacity);
        let mut ticker = tokio::time::interval(config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(scope = %task_scope, "remediator started");
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                maybe = rx.recv() => match maybe {
                    Some(d) => queue.push(d),
                    None => {
                        debug!(scope = %task_scope, "delta channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    for d in queue.drain_ready() {
                        rem.evaluate(d).await;
                    }
                }
            }
        }
        watches.detach(&task_scope);
        info!(scope = %task_scope, dropped = queue.dropped(), "remediator stopped");
    });

    RemediatorHandle { scope, ledger, stop: Some(stop_tx), task }
}
