//! conform reconciler loop: one scope, one sequential stream of apply cycles.
//!
//! A cycle fetches the declared set, hands it to the applier, publishes the
//! last-declared cache the remediator reads, points the shared watch registry at
//! the declared kinds and publishes a fresh [`SyncStatus`].

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use conform_apply::{Applier, ApplyOutcome};
use conform_core::{DeclaredResource, Management, ScopeId, StatusError};
use conform_inventory::{Inventory, InventoryStore};
use conform_kubehub::ClusterClient;
use conform_ownership::OwnershipRegistry;
use conform_remediator::{Ledger, WatchRegistry};
use conform_store::{CacheHandle, DeclaredCache, DeclaredEntry, DeclaredSnapshot, SnapshotBuilder};
use metrics::{counter, histogram};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub mod config;
pub mod source;
pub mod status;

pub use config::{ReconcilerConfig, DEFAULT_POLL, DEFAULT_RESYNC};
pub use source::{DeclaredSet, DeclaredSource, DirSource, SourceError};
pub use status::{StatusBoard, StatusHandle, SyncStatus};

pub struct Reconciler {
    config: ReconcilerConfig,
    client: Arc<dyn ClusterClient>,
    source: Arc<dyn DeclaredSource>,
    watches: Arc<WatchRegistry>,
    registry: OwnershipRegistry,
    applier: Applier,
    inventory: InventoryStore,
    cache: DeclaredCache,
    status: StatusBoard,
    /// Set while a remediator runs; its kinds follow the declared set.
    ledger: Option<Ledger>,
    last_revision: Option<String>,
    /// Errors the latest cycle raised itself, before remediator errors are merged in.
    cycle_errors: Vec<StatusError>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        client: Arc<dyn ClusterClient>,
        source: Arc<dyn DeclaredSource>,
        watches: Arc<WatchRegistry>,
    ) -> Self {
        let scope = config.scope.clone();
        let registry = OwnershipRegistry::new(scope.clone(), config.policy.clone());
        let applier = Applier::new(Arc::clone(&client), registry.clone(), config.backoff.clone());
        let inventory =
            InventoryStore::new(Arc::clone(&client), scope.clone(), &config.inventory_namespace, config.backoff.clone());
        Self {
            config,
            client,
            source,
            watches,
            registry,
            applier,
            inventory,
            cache: DeclaredCache::new(),
            status: StatusBoard::new(scope),
            ledger: None,
            last_revision: None,
            cycle_errors: Vec::new(),
        }
    }

    pub fn scope(&self) -> &ScopeId {
        &self.config.scope
    }

    pub fn status(&self) -> StatusHandle {
        self.status.handle()
    }

    pub fn cache(&self) -> CacheHandle {
        self.cache.handle()
    }

    /// Read the scope's persisted inventory.
    pub async fn inventory(&self) -> Result<Inventory, conform_inventory::InventoryError> {
        self.inventory.load().await
    }

    /// Fetch the declared set and run one cycle whatever its revision.
    pub async fn run_cycle(&mut self) -> Arc<SyncStatus> {
        match self.source.fetch().await {
            Ok(set) => self.sync(set).await,
            Err(e) => self.source_failed(e),
        }
    }

    fn source_failed(&mut self, e: SourceError) -> Arc<SyncStatus> {
        warn!(scope = %self.scope(), error = %e, "declared set unavailable");
        counter!("conform_reconcile_cycles_total", 1u64, "result" => "source_error");
        // the next successful fetch must run a cycle to clear this status
        self.last_revision = None;
        let prev = self.status.current();
        let mut status = SyncStatus::pending(self.scope().clone());
        status.revision = prev.revision.clone();
        status.last_synced_at = prev.last_synced_at;
        status.inventory_generation = prev.inventory_generation;
        status.errors = vec![e.to_status()];
        self.cycle_errors = status.errors.clone();
        self.status.publish(status)
    }

    /// Run one apply cycle for `set`.
    pub async fn sync(&mut self, set: DeclaredSet) -> Arc<SyncStatus> {
        let t0 = Instant::now();
        let scope = self.scope().clone();
        info!(scope = %scope, revision = %set.revision, resources = set.resources.len(), "apply cycle starting");

        let previous = match self.inventory.load().await {
            Ok(inv) => inv,
            Err(e) => {
                warn!(scope = %scope, error = %e, "inventory unreadable; cycle skipped");
                counter!("conform_reconcile_cycles_total", 1u64, "result" => "inventory_error");
                self.last_revision = None;
                let mut status = SyncStatus::pending(scope);
                status.revision = Some(set.revision);
                status.last_synced_at = Some(Utc::now());
                status.errors = vec![e.to_status()];
                self.cycle_errors = status.errors.clone();
                return self.status.publish(status);
            }
        };

        // Entries whose declaration changes or disappears this cycle leave the cache
        // first, so the remediator neither resurrects prunes nor reverts new content.
        let prior = self.cache.current();
        let retired = retire(&prior, &set);
        debug!(scope = %scope, kept = retired.len(), "retiring changed declarations");
        self.cache.publish(retired);

        let out = self.applier.apply(&set.resources, &previous, &self.inventory).await;

        let snapshot = self.publish_applied(&prior, &set, &out);
        if self.ledger.is_some() {
            self.watches.set_kinds(&scope, &snapshot.gvks());
        }

        self.cycle_errors = out.errors.clone();
        let mut errors = out.errors.clone();
        if let Some(ledger) = &self.ledger {
            merge_errors(&mut errors, ledger.errors_for(&snapshot));
        }
        let status = SyncStatus {
            scope: scope.clone(),
            revision: Some(set.revision.clone()),
            last_synced_at: Some(Utc::now()),
            counts: out.counts.clone(),
            errors,
            inventory_generation: out
                .inventory
                .as_ref()
                .map(|i| i.generation)
                .or_else(|| previous.resource_version().map(|_| previous.generation)),
        };
        let result = if status.errors.is_empty() { "ok" } else { "errors" };
        counter!("conform_reconcile_cycles_total", 1u64, "result" => result);
        histogram!("conform_reconcile_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            scope = %scope,
            revision = %set.revision,
            cached = snapshot.len(),
            errors = status.errors.len(),
            took_ms = %t0.elapsed().as_millis(),
            "apply cycle finished"
        );
        self.last_revision = Some(set.revision);
        self.status.publish(status)
    }

    /// Cache what converged this cycle; declarations that did not converge keep the
    /// entry of the last cycle that applied them.
    fn publish_applied(&self, prior: &DeclaredSnapshot, set: &DeclaredSet, out: &ApplyOutcome) -> Arc<DeclaredSnapshot> {
        let mut next = SnapshotBuilder::new(set.revision.clone());
        for d in set.resources.iter().filter(|d| d.management == Management::Enabled) {
            if out.applied.contains(&d.id) {
                next.insert(DeclaredEntry::new(d.clone()));
            } else if let Some(old) = prior.get(&d.id) {
                next.keep(Arc::clone(old));
            }
        }
        self.cache.publish(next);
        self.cache.current()
    }

    /// Republish the latest status with the remediator's current standing errors.
    /// Counts, revision and sync time stay those of the last cycle.
    fn refresh_remediation_errors(&self) -> Option<Arc<SyncStatus>> {
        let ledger = self.ledger.as_ref()?;
        let current = self.status.current();
        let mut errors = self.cycle_errors.clone();
        merge_errors(&mut errors, ledger.errors_for(&self.cache.current()));
        if errors == current.errors {
            return None;
        }
        debug!(scope = %self.scope(), before = current.errors.len(), after = errors.len(), "remediation errors changed");
        let mut status = (*current).clone();
        status.errors = errors;
        Some(self.status.publish(status))
    }

    /// Run cycles until `shutdown` resolves, with the remediator running alongside.
    /// A cycle runs when the source reports a new revision or the resync period has
    /// elapsed; a cycle in flight is finished before shutting down. Conflicts and
    /// failed corrections the remediator raises in between are published at once.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let remediator = conform_remediator::spawn(
            Arc::clone(&self.client),
            &self.registry,
            self.cache.handle(),
            Arc::clone(&self.watches),
            self.config.remediator.clone(),
        );
        self.ledger = Some(remediator.ledger().clone());
        let mut ledger_changes = remediator.ledger().subscribe();

        let mut ticker = tokio::time::interval(self.config.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_cycle: Option<Instant> = None;
        tokio::pin!(shutdown);
        info!(scope = %self.scope(), poll = ?self.config.poll_period, resync = ?self.config.resync_period, "reconciler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Ok(()) = ledger_changes.changed() => {
                    self.refresh_remediation_errors();
                }
                _ = ticker.tick() => {
                    let set = match self.source.fetch().await {
                        Ok(set) => set,
                        Err(e) => {
                            self.source_failed(e);
                            continue;
                        }
                    };
                    let resync_due = last_cycle.map_or(true, |t| t.elapsed() >= self.config.resync_period);
                    let new_revision = self.last_revision.as_deref() != Some(set.revision.as_str());
                    if new_revision || resync_due {
                        debug!(scope = %self.scope(), new_revision, resync_due, "cycle due");
                        self.sync(set).await;
                        last_cycle = Some(Instant::now());
                    }
                }
            }
        }
        info!(scope = %self.scope(), "reconciler stopping");
        remediator.shutdown().await;
    }
}

/// Previous entries whose declaration is unchanged and still managed.
fn retire(prior: &DeclaredSnapshot, set: &DeclaredSet) -> SnapshotBuilder {
    let mut b = SnapshotBuilder::new(prior.revision.clone().unwrap_or_default());
    let unchanged = set.resources.iter().filter(|d| d.management == Management::Enabled).filter_map(|d| {
        let old = prior.get(&d.id)?;
        (old.resource == *d).then(|| Arc::clone(old))
    });
    for entry in unchanged {
        b.keep(entry);
    }
    b
}

/// Append remediator errors the cycle did not already report for the same objects.
fn merge_errors(errors: &mut Vec<StatusError>, standing: Vec<StatusError>) {
    let seen: BTreeSet<_> = errors.iter().map(|e| (e.code, e.resources.clone())).collect();
    errors.extend(standing.into_iter().filter(|e| !seen.contains(&(e.code, e.resources.clone()))));
}
