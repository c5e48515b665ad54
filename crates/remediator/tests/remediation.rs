#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use conform_apply::Applier;
use conform_core::{keys, DeclaredResource, Delta, DeltaKind, ErrorCode, Gvk, LiveResource, ResourceId, ScopeId};
use conform_kubehub::{Backoff, ClusterClient, MemCluster};
use conform_ownership::{ConflictPolicy, OwnershipRegistry};
use conform_remediator::{spawn, RemediationState, RemediatorConfig, RemediatorHandle, WatchRegistry};
use conform_store::{DeclaredCache, DeclaredEntry, SnapshotBuilder};
use serde_json::json;
use tokio::sync::mpsc;

fn scope() -> ScopeId {
    ScopeId::root("platform")
}

fn gvk() -> Gvk {
    Gvk::new("", "v1", "ConfigMap")
}

fn id() -> ResourceId {
    ResourceId::new(&gvk(), Some("app"), "settings")
}

fn declared() -> DeclaredResource {
    DeclaredResource::from_manifest(
        json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "app"}, "data": {"mode": "strict"}}),
        None,
    )
    .unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Harness {
    cluster: Arc<MemCluster>,
    watches: Arc<WatchRegistry>,
    handle: RemediatorHandle,
    _cache: DeclaredCache,
}

impl Harness {
    async fn start(config: RemediatorConfig) -> Self {
        let cluster = Arc::new(MemCluster::new());
        let registry = OwnershipRegistry::new(scope(), ConflictPolicy::default());
        let applier = Applier::new(cluster.clone(), registry.clone(), Backoff::immediate(3));
        applier.converge(&declared()).await.unwrap();

        let cache = DeclaredCache::new();
        let mut b = SnapshotBuilder::new("rev-1");
        b.insert(DeclaredEntry::new(declared()));
        cache.publish(b);

        let watches = Arc::new(WatchRegistry::new(cluster.clone(), Backoff::immediate(3)));
        let handle = spawn(cluster.clone(), &registry, cache.handle(), watches.clone(), config);
        watches.set_kinds(&scope(), &cache.current().gvks());
        let h = Self { cluster, watches, handle, _cache: cache };
        eventually("initial evaluation", || h.state() == Some(RemediationState::Watching)).await;
        h
    }

    fn state(&self) -> Option<RemediationState> {
        self.handle.ledger().state(&id())
    }

    fn live(&self) -> Option<LiveResource> {
        self.cluster.peek(&id()).map(LiveResource::new)
    }

    fn mode(&self) -> Option<String> {
        self.live().and_then(|l| l.raw()["data"]["mode"].as_str().map(str::to_string))
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delta>) -> Delta {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
}

fn fast() -> RemediatorConfig {
    RemediatorConfig { tick: Duration::from_millis(2), backoff: Backoff::immediate(3), ..Default::default() }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_edit_of_a_declared_field_is_reverted() {
    let h = Harness::start(fast()).await;
    h.cluster.edit(&id(), |o| {
        o["data"]["mode"] = json!("lenient");
        o["data"]["added-by-hand"] = json!("x");
    });
    eventually("revert", || h.mode().as_deref() == Some("strict")).await;
    // fields nobody declared are left alone
    assert_eq!(h.live().unwrap().raw()["data"]["added-by-hand"], "x");
    eventually("back to watching", || h.state() == Some(RemediationState::Watching)).await;
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_delete_is_recreated_with_our_stamp() {
    let h = Harness::start(fast()).await;
    h.cluster.delete(&id(), None).await.unwrap();
    eventually("recreate", || h.live().is_some_and(|l| l.manager() == Some(scope()))).await;
    assert_eq!(h.mode().as_deref(), Some("strict"));
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_stamp_is_restored() {
    let h = Harness::start(fast()).await;
    h.cluster.edit(&id(), |o| {
        o["metadata"]["annotations"].as_object_mut().unwrap().remove(keys::MANAGER);
    });
    eventually("stamp restored", || h.live().is_some_and(|l| l.manager() == Some(scope()))).await;
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn another_owner_is_reported_not_overwritten() {
    let h = Harness::start(fast()).await;
    let mut changes = h.handle.ledger().subscribe();
    let other = ScopeId::root("other");
    h.cluster.edit(&id(), |o| {
        o["metadata"]["annotations"][keys::MANAGER] = json!(other.manager());
        o["data"]["mode"] = json!("theirs");
    });
    tokio::time::timeout(Duration::from_secs(2), changes.changed()).await.unwrap().unwrap();
    eventually("conflict", || h.state() == Some(RemediationState::ConflictReported { owner: Some(other.clone()) })).await;
    let errors = h.handle.ledger().errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorCode::ManagementConflict);
    assert!(errors[0].names(&id()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.mode().as_deref(), Some("theirs"));

    // ownership comes back: the conflict clears and drift is corrected
    h.cluster.edit(&id(), |o| {
        o["metadata"]["annotations"][keys::MANAGER] = json!(scope().manager());
    });
    eventually("corrected", || h.mode().as_deref() == Some("strict")).await;
    eventually("cleared", || h.handle.ledger().errors().is_empty()).await;
    assert!(changes.has_changed().unwrap());
    assert!(h.handle.ledger().conflicts().is_empty());
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeatedly_stripped_stamp_becomes_a_standing_conflict() {
    let config = RemediatorConfig { flip_threshold: 3, ..fast() };
    let h = Harness::start(config).await;
    let strip = |c: &MemCluster| {
        c.edit(&id(), |o| {
            o["metadata"]["annotations"].as_object_mut().unwrap().remove(keys::MANAGER);
        });
    };

    strip(&h.cluster);
    eventually("first restore", || h.live().is_some_and(|l| l.manager() == Some(scope()))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    strip(&h.cluster);
    eventually("standing conflict", || h.state() == Some(RemediationState::ConflictReported { owner: None })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.live().unwrap().manager().is_none());
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_reset_relists_and_keeps_correcting() {
    let h = Harness::start(fast()).await;
    h.cluster.break_watches(&gvk());
    h.cluster.delete(&id(), None).await.unwrap();
    eventually("recreated after re-list", || h.live().is_some()).await;
    h.cluster.edit(&id(), |o| o["data"]["mode"] = json!("lenient"));
    eventually("revert after reset", || h.mode().as_deref() == Some("strict")).await;
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undeclared_objects_are_ignored() {
    let h = Harness::start(fast()).await;
    h.cluster
        .create(&json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "stray", "namespace": "app"}}))
        .await
        .unwrap();
    let before = h.cluster.mutation_count();
    h.cluster.edit(&ResourceId::new(&gvk(), Some("app"), "stray"), |o| o["data"] = json!({"k": "v"}));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.cluster.mutation_count(), before + 1);
    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_releases_the_scopes_watches() {
    let h = Harness::start(fast()).await;
    assert_eq!(h.watches.watched(), vec![gvk()]);
    let Harness { cluster, watches, handle, .. } = h;
    handle.shutdown().await;
    assert!(watches.watched().is_empty());
    eventually("stream dropped", || cluster.watcher_count(&gvk()) == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kind_watches_are_reference_counted_across_scopes() {
    let cluster = Arc::new(MemCluster::new());
    let watches = WatchRegistry::new(cluster.clone(), Backoff::immediate(3));
    let a = ScopeId::root("a");
    let b = ScopeId::namespaced("app", "b");
    let secrets = Gvk::new("", "v1", "Secret");
    let both: BTreeSet<Gvk> = [gvk(), secrets.clone()].into_iter().collect();
    let only_cm: BTreeSet<Gvk> = [gvk()].into_iter().collect();

    watches.set_kinds(&a, &both);
    watches.set_kinds(&b, &only_cm);
    assert_eq!(watches.interest(&gvk()), 2);
    assert_eq!(watches.interest(&secrets), 1);
    eventually("watches open", || cluster.watcher_count(&gvk()) == 1 && cluster.watcher_count(&secrets) == 1).await;

    watches.set_kinds(&a, &only_cm);
    assert_eq!(watches.interest(&secrets), 0);
    assert_eq!(watches.watched(), vec![gvk()]);
    eventually("secret watch closed", || cluster.watcher_count(&secrets) == 0).await;

    watches.set_kinds(&a, &BTreeSet::new());
    assert_eq!(watches.interest(&gvk()), 1);
    watches.detach(&b);
    assert!(watches.watched().is_empty());
    eventually("all closed", || cluster.watcher_count(&gvk()) == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scope_joining_a_running_watch_sees_existing_objects() {
    let cluster = Arc::new(MemCluster::new());
    cluster
        .create(&json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "settings", "namespace": "app"}}))
        .await
        .unwrap();
    let watches = WatchRegistry::new(cluster.clone(), Backoff::immediate(3));
    let kinds: BTreeSet<Gvk> = [gvk()].into_iter().collect();

    let a = ScopeId::root("a");
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    watches.attach(&a, tx_a);
    watches.set_kinds(&a, &kinds);
    assert_eq!(next(&mut rx_a).await.id, id());

    let b = ScopeId::namespaced("app", "b");
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    watches.attach(&b, tx_b);
    watches.set_kinds(&b, &kinds);
    let primed = next(&mut rx_b).await;
    assert_eq!(primed.id, id());
    assert_eq!(primed.kind, DeltaKind::Applied);
    // one shared stream; the earlier scope gets nothing replayed
    assert_eq!(cluster.watcher_count(&gvk()), 1);
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn platform_fields_inside_list_elements_are_not_drift() {
    let svc_id = ResourceId::new(&Gvk::new("", "v1", "Service"), Some("app"), "web");
    let svc = DeclaredResource::from_manifest(
        json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web", "namespace": "app"},
            "spec": {"type": "NodePort", "ports": [{"port": 80, "protocol": "TCP"}]}}),
        None,
    )
    .unwrap();
    let cluster = Arc::new(MemCluster::new());
    let registry = OwnershipRegistry::new(scope(), ConflictPolicy::default());
    Applier::new(cluster.clone(), registry.clone(), Backoff::immediate(3)).converge(&svc).await.unwrap();
    let cache = DeclaredCache::new();
    let mut b = SnapshotBuilder::new("rev-1");
    b.insert(DeclaredEntry::new(svc));
    cache.publish(b);
    let watches = Arc::new(WatchRegistry::new(cluster.clone(), Backoff::immediate(3)));
    let handle = spawn(cluster.clone(), &registry, cache.handle(), watches.clone(), fast());
    watches.set_kinds(&scope(), &cache.current().gvks());
    eventually("initial evaluation", || handle.ledger().state(&svc_id) == Some(RemediationState::Watching)).await;

    cluster.edit(&svc_id, |o| o["spec"]["ports"][0]["nodePort"] = json!(30007));
    let after_edit = cluster.mutation_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.mutation_count(), after_edit, "an undeclared element field was corrected");
    assert_eq!(handle.ledger().state(&svc_id), Some(RemediationState::Watching));

    // a declared field of the same element is still corrected, the assigned port stays
    cluster.edit(&svc_id, |o| o["spec"]["ports"][0]["protocol"] = json!("UDP"));
    let port = || cluster.peek(&svc_id).map(|o| o["spec"]["ports"][0].clone());
    eventually("protocol reverted", || port().is_some_and(|p| p["protocol"] == "TCP")).await;
    assert_eq!(port().unwrap()["nodePort"], 30007);
    handle.shutdown().await;
}
