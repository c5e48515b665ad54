#![forbid(unsafe_code)]

use std::sync::Arc;

use conform_apply::{ApplyOutcome, Applier};
use conform_core::keys;
use conform_core::prelude::*;
use conform_inventory::{InventoryStore, DEFAULT_NAMESPACE, NAME_PREFIX};
use conform_kubehub::{Backoff, ClusterClient, MemCluster, MutationOp};
use conform_ownership::{ConflictPolicy, OwnershipRegistry};
use serde_json::json;

struct Scope {
    applier: Applier,
    store: InventoryStore,
}

impl Scope {
    fn new(cluster: &Arc<MemCluster>, scope: ScopeId) -> Self {
        let registry = OwnershipRegistry::new(scope.clone(), ConflictPolicy::default());
        Self {
            applier: Applier::new(cluster.clone(), registry, Backoff::immediate(3)),
            store: InventoryStore::new(cluster.clone(), scope, DEFAULT_NAMESPACE, Backoff::immediate(3)),
        }
    }

    async fn apply(&self, declared: &[DeclaredResource]) -> ApplyOutcome {
        let previous = self.store.load().await.unwrap();
        self.applier.apply(declared, &previous, &self.store).await
    }
}

fn decl(v: Json) -> DeclaredResource {
    DeclaredResource::from_manifest(v, None).unwrap()
}

fn namespace(name: &str) -> DeclaredResource {
    decl(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": name}}))
}

fn cm(name: &str, data: Json, annotations: Json) -> DeclaredResource {
    let mut v = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "app"},
        "data": data,
    });
    if annotations.as_object().is_some_and(|a| !a.is_empty()) {
        v["metadata"]["annotations"] = annotations;
    }
    decl(v)
}

fn cm_id(ns: &str, name: &str) -> ResourceId {
    ResourceId::new(&Gvk::new("", "v1", "ConfigMap"), Some(ns), name)
}

fn ns_id(name: &str) -> ResourceId {
    ResourceId::new(&Gvk::new("", "v1", "Namespace"), None, name)
}

fn needs(name: &str) -> Json {
    json!({ keys::DEPENDS_ON: format!("/namespaces/app/ConfigMap/{}", name) })
}

/// Journal entries for everything except inventories.
fn workload(cluster: &MemCluster) -> Vec<(MutationOp, ResourceId)> {
    cluster
        .journal()
        .into_iter()
        .filter(|m| !m.id.name.starts_with(NAME_PREFIX))
        .map(|m| (m.op, m.id))
        .collect()
}

fn codes(out: &ApplyOutcome) -> Vec<&'static str> {
    out.errors.iter().map(|e| e.code.as_str()).collect()
}

fn chain() -> Vec<DeclaredResource> {
    vec![
        cm("cm2", json!({"k": "2"}), needs("cm1")),
        namespace("app"),
        cm("cm1", json!({"k": "1"}), json!({})),
    ]
}

#[tokio::test]
async fn creates_in_dependency_order_and_second_apply_is_a_no_op() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));

    let out = scope.apply(&chain()).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.total().created, 3);
    assert_eq!(
        workload(&cluster),
        vec![
            (MutationOp::Create, ns_id("app")),
            (MutationOp::Create, cm_id("app", "cm1")),
            (MutationOp::Create, cm_id("app", "cm2")),
        ]
    );
    let inv = out.inventory.unwrap();
    assert_eq!(inv.entries.len(), 3);
    assert!(inv.contains(&cm_id("app", "cm2")));
    assert_eq!(out.applied_gvks.len(), 2);

    let before = cluster.mutation_count();
    let again = scope.apply(&chain()).await;
    assert!(again.errors.is_empty(), "{:?}", again.errors);
    assert_eq!(cluster.mutation_count(), before);
    assert_eq!(again.total(), Default::default());
    assert_eq!(again.applied.len(), 3);
}

fn web_service(ports: Json) -> DeclaredResource {
    decl(json!({"apiVersion": "v1", "kind": "Service",
        "metadata": {"name": "web", "namespace": "app"},
        "spec": {"type": "NodePort", "selector": {"app": "web"}, "ports": ports}}))
}

#[tokio::test]
async fn platform_assigned_node_ports_survive_reapply() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let svc_id = ResourceId::new(&Gvk::new("", "v1", "Service"), Some("app"), "web");
    let declared = || vec![namespace("app"), web_service(json!([{"port": 80}]))];
    assert!(scope.apply(&declared()).await.errors.is_empty());

    // assigned by the platform after create
    cluster.edit(&svc_id, |o| o["spec"]["ports"][0]["nodePort"] = json!(30007));
    let before = cluster.mutation_count();
    let again = scope.apply(&declared()).await;
    assert!(again.errors.is_empty(), "{:?}", again.errors);
    assert_eq!(again.total(), Default::default());
    assert_eq!(cluster.mutation_count(), before);
    assert_eq!(cluster.peek(&svc_id).unwrap()["spec"]["ports"][0]["nodePort"], 30007);

    // a new declared sub-field is merged into the element, the assigned port stays
    let out = scope.apply(&[namespace("app"), web_service(json!([{"port": 80, "targetPort": 8080}]))]).await;
    assert_eq!(out.total().updated, 1);
    assert_eq!(
        cluster.peek(&svc_id).unwrap()["spec"]["ports"],
        json!([{"port": 80, "nodePort": 30007, "targetPort": 8080}])
    );
}

#[tokio::test]
async fn prune_runs_in_reverse_dependency_order() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    scope.apply(&chain()).await;
    let created = workload(&cluster).len();

    let out = scope.apply(&[]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.total().deleted, 3);
    assert_eq!(
        workload(&cluster)[created..].to_vec(),
        vec![
            (MutationOp::Delete, cm_id("app", "cm2")),
            (MutationOp::Delete, cm_id("app", "cm1")),
            (MutationOp::Delete, ns_id("app")),
        ]
    );
    assert!(out.inventory.unwrap().is_empty());
}

#[tokio::test]
async fn prevent_deletion_objects_are_abandoned_not_deleted() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let keep = cm("keep", json!({"k": "v"}), json!({ keys::LIFECYCLE_DELETION: keys::LIFECYCLE_DETACH }));
    scope.apply(&[keep]).await;

    let out = scope.apply(&[]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.total().deleted, 0);
    assert_eq!(out.total().released, 1);
    let live = LiveResource::new(cluster.peek(&cm_id("app", "keep")).unwrap());
    assert!(live.manager().is_none());
    assert_eq!(live.raw()["data"]["k"], "v");
    assert!(!workload(&cluster).iter().any(|(op, _)| *op == MutationOp::Delete));
    assert!(out.inventory.unwrap().is_empty());
}

#[tokio::test]
async fn disabled_management_releases_without_deleting() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    scope.apply(&[cm("cm1", json!({"k": "v"}), json!({}))]).await;

    let disabled = cm("cm1", json!({"k": "v"}), json!({ keys::MANAGEMENT: keys::MANAGEMENT_DISABLED }));
    let out = scope.apply(&[disabled]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.total().released, 1);
    let live = LiveResource::new(cluster.peek(&cm_id("app", "cm1")).unwrap());
    assert!(live.manager().is_none());
    assert!(live.label(keys::MANAGED_LABEL).is_none());
    assert_eq!(live.raw()["data"]["k"], "v");
    assert!(out.inventory.unwrap().is_empty());
}

#[tokio::test]
async fn local_config_is_never_sent() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let local = cm("local", json!({"k": "v"}), json!({ keys::LOCAL_CONFIG: "true" }));
    let out = scope.apply(&[local, cm("cm1", json!({}), json!({}))]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert!(cluster.peek(&cm_id("app", "local")).is_none());
    assert!(!out.inventory.unwrap().contains(&cm_id("app", "local")));
}

#[tokio::test]
async fn cycle_is_reported_and_the_rest_still_applies() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let declared = vec![
        cm("x", json!({}), needs("y")),
        cm("y", json!({}), needs("z")),
        cm("z", json!({}), needs("x")),
        cm("w", json!({}), json!({})),
    ];
    let out = scope.apply(&declared).await;
    assert_eq!(codes(&out), vec!["E1010"]);
    let cycle = &out.errors[0];
    for n in ["x", "y", "z"] {
        assert!(cycle.names(&cm_id("app", n)));
        assert!(cluster.peek(&cm_id("app", n)).is_none());
    }
    assert!(cluster.peek(&cm_id("app", "w")).is_some());
    assert_eq!(out.inventory.unwrap().entries.into_iter().collect::<Vec<_>>(), vec![cm_id("app", "w")]);
}

#[tokio::test]
async fn competing_scopes_leave_a_single_owner() {
    let cluster = Arc::new(MemCluster::new());
    let a = Scope::new(&cluster, ScopeId::root("a"));
    let b = Scope::new(&cluster, ScopeId::root("b"));
    let shared = || vec![cm("shared", json!({"from": "a"}), json!({}))];

    assert!(a.apply(&shared()).await.errors.is_empty());
    let writes = workload(&cluster).len();

    let mut settled = 0;
    for round in 0..3 {
        let out = b.apply(&[cm("shared", json!({"from": "b"}), json!({}))]).await;
        assert_eq!(codes(&out), vec!["E1060"]);
        assert!(out.errors[0].names(&cm_id("app", "shared")));
        assert!(!out.inventory.unwrap().contains(&cm_id("app", "shared")));
        // the first round creates b's empty inventory; after that nothing is written
        if round > 0 {
            assert_eq!(cluster.mutation_count(), settled, "round {round} wrote to the cluster");
        }
        settled = cluster.mutation_count();
    }
    assert_eq!(workload(&cluster).len(), writes);

    let out = a.apply(&shared()).await;
    assert!(out.errors.is_empty());
    let live = LiveResource::new(cluster.peek(&cm_id("app", "shared")).unwrap());
    assert_eq!(live.manager(), Some(ScopeId::root("a")));
    assert_eq!(live.raw()["data"]["from"], "a");
}

#[tokio::test]
async fn root_preemption_takes_over_namespace_objects_when_enabled() {
    let cluster = Arc::new(MemCluster::new());
    let team = Scope::new(&cluster, ScopeId::namespaced("app", "team"));
    team.apply(&[cm("shared", json!({"from": "team"}), json!({}))]).await;

    let registry = OwnershipRegistry::new(
        ScopeId::root("platform"),
        ConflictPolicy { root_preempts_namespace: true, ..Default::default() },
    );
    let root = Scope {
        applier: Applier::new(cluster.clone(), registry, Backoff::immediate(3)),
        store: InventoryStore::new(cluster.clone(), ScopeId::root("platform"), DEFAULT_NAMESPACE, Backoff::immediate(3)),
    };
    let out = root.apply(&[cm("shared", json!({"from": "root"}), json!({}))]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    let live = LiveResource::new(cluster.peek(&cm_id("app", "shared")).unwrap());
    assert_eq!(live.manager(), Some(ScopeId::root("platform")));

    // the namespace scope now sees a conflict instead of fighting back
    let out = team.apply(&[cm("shared", json!({"from": "team"}), json!({}))]).await;
    assert_eq!(codes(&out), vec!["E1060"]);
}

#[tokio::test]
async fn merge_keeps_fields_set_by_others() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let id = cm_id("app", "cm1");
    scope.apply(&[cm("cm1", json!({"a": "1", "b": "1"}), json!({}))]).await;
    cluster.edit(&id, |o| {
        o["data"]["extra"] = json!("platform");
        o["metadata"]["labels"]["team"] = json!("ops");
    });

    let out = scope.apply(&[cm("cm1", json!({"a": "2"}), json!({}))]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.total().updated, 1);
    let live = cluster.peek(&id).unwrap();
    assert_eq!(live["data"], json!({"a": "2", "extra": "platform"}));
    assert_eq!(live["metadata"]["labels"]["team"], "ops");
}

#[tokio::test]
async fn rejected_apply_blocks_its_dependents() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    cluster.reject_writes(&cm_id("app", "cm1"), ClusterError::Invalid("admission webhook denied".into()));

    let out = scope.apply(&[cm("cm1", json!({}), json!({})), cm("cm2", json!({}), needs("cm1"))]).await;
    assert_eq!(codes(&out), vec!["E2009", "E1011"]);
    assert!(out.errors[0].names(&cm_id("app", "cm1")));
    assert!(out.errors[1].names(&cm_id("app", "cm2")));
    assert!(cluster.peek(&cm_id("app", "cm2")).is_none());
    let inv = out.inventory.unwrap();
    assert!(inv.contains(&cm_id("app", "cm1")) && inv.contains(&cm_id("app", "cm2")));

    let settled = cluster.mutation_count();
    let out = scope.apply(&[cm("cm1", json!({}), json!({})), cm("cm2", json!({}), needs("cm1"))]).await;
    assert_eq!(codes(&out), vec!["E2009", "E1011"]);
    assert_eq!(cluster.mutation_count(), settled);
}

#[tokio::test]
async fn missing_external_prerequisite_waits_for_it() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let declared = vec![cm(
        "cm1",
        json!({}),
        json!({ keys::DEPENDS_ON: "/namespaces/app/Secret/creds" }),
    )];

    let out = scope.apply(&declared).await;
    assert_eq!(codes(&out), vec!["E1011"]);
    assert!(cluster.peek(&cm_id("app", "cm1")).is_none());

    cluster
        .create(&json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "creds", "namespace": "app"}}))
        .await
        .unwrap();
    let out = scope.apply(&declared).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert!(cluster.peek(&cm_id("app", "cm1")).is_some());
}

#[tokio::test]
async fn prune_is_held_back_while_still_depended_on() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    scope.apply(&[cm("cm1", json!({}), json!({})), cm("cm2", json!({}), needs("cm1"))]).await;

    let out = scope.apply(&[cm("cm2", json!({}), needs("cm1"))]).await;
    assert_eq!(codes(&out), vec!["E1012"]);
    assert!(out.errors[0].names(&cm_id("app", "cm1")));
    assert!(cluster.peek(&cm_id("app", "cm1")).is_some());
    assert!(out.inventory.unwrap().contains(&cm_id("app", "cm1")));
}

#[tokio::test]
async fn prune_skips_objects_adopted_by_another_scope() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let id = cm_id("app", "cm1");
    scope.apply(&[cm("cm1", json!({}), json!({}))]).await;
    cluster.edit(&id, |o| {
        o["metadata"]["annotations"][keys::MANAGER] = json!(ScopeId::root("other").manager());
    });

    let out = scope.apply(&[]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert!(cluster.peek(&id).is_some());
    assert!(out.inventory.unwrap().is_empty());
}

#[tokio::test]
async fn failed_delete_stays_in_inventory() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let id = cm_id("app", "cm1");
    scope.apply(&[cm("cm1", json!({}), json!({}))]).await;
    cluster.reject_writes(&id, ClusterError::Forbidden("deletes are not allowed".into()));

    let out = scope.apply(&[]).await;
    assert_eq!(codes(&out), vec!["E2011"]);
    assert!(out.inventory.unwrap().contains(&id));

    cluster.clear_faults(&id);
    let out = scope.apply(&[]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert!(cluster.peek(&id).is_none());
}

#[tokio::test]
async fn namespace_scope_is_confined_to_its_namespace() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::namespaced("app", "team"));
    let foreign = decl(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "other"}}));
    let out = scope.apply(&[foreign, namespace("extra"), cm("mine", json!({}), json!({}))]).await;
    assert_eq!(codes(&out), vec!["E1020", "E1020"]);
    assert!(cluster.peek(&cm_id("other", "x")).is_none());
    assert!(cluster.peek(&ns_id("extra")).is_none());
    assert!(cluster.peek(&cm_id("app", "mine")).is_some());
    assert_eq!(scope.store.id().namespace.as_deref(), Some("app"));
}

#[tokio::test]
async fn transient_unavailability_is_retried() {
    let cluster = Arc::new(MemCluster::new());
    let scope = Scope::new(&cluster, ScopeId::root("platform"));
    let id = cm_id("app", "cm1");
    cluster.fail_next(&id, 2, ClusterError::Unavailable("etcd leader change".into()));
    let out = scope.apply(&[cm("cm1", json!({}), json!({}))]).await;
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert!(cluster.peek(&id).is_some());
}
