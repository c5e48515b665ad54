//! conform dependency graph.
//!
//! Nodes are the resources of one declared set (or of one prune batch); an edge
//! runs from a prerequisite to its dependent. Besides explicit depends-on
//! references, a Namespace precedes every object inside it and a
//! CustomResourceDefinition precedes every object of the kind it defines.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use conform_core::{DeclaredResource, ErrorCode, Json, LiveResource, ObjectRef, ResourceId, StatusError};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    DependsOn,
    Namespace,
    CustomResource,
}

/// Anything that can sit in the graph: declared manifests and live objects.
pub trait GraphNode {
    fn node_id(&self) -> Option<ResourceId>;
    fn explicit_prerequisites(&self) -> Vec<ObjectRef>;
    fn payload(&self) -> &Json;
}

impl GraphNode for DeclaredResource {
    fn node_id(&self) -> Option<ResourceId> {
        Some(self.id.clone())
    }

    fn explicit_prerequisites(&self) -> Vec<ObjectRef> {
        self.depends_on.to_vec()
    }

    fn payload(&self) -> &Json {
        &self.payload
    }
}

impl GraphNode for LiveResource {
    fn node_id(&self) -> Option<ResourceId> {
        self.id()
    }

    fn explicit_prerequisites(&self) -> Vec<ObjectRef> {
        self.depends_on()
    }

    fn payload(&self) -> &Json {
        self.raw()
    }
}

/// (group, kind) served by a CustomResourceDefinition payload.
pub fn defined_kind(payload: &Json) -> Option<(String, String)> {
    let spec = payload.get("spec")?;
    let group = spec.get("group")?.as_str()?;
    let kind = spec.get("names")?.get("kind")?.as_str()?;
    Some((group.to_string(), kind.to_string()))
}

fn join_ids(ids: &[ResourceId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle among {}", join_ids(.members))]
    Cycle { members: Vec<ResourceId> },
    #[error("{id} depends on {on}, which is part of a dependency cycle")]
    Blocked { id: ResourceId, on: ResourceId },
    #[error("{id} depends on {reference}, which does not exist")]
    MissingPrerequisite { id: ResourceId, reference: ObjectRef },
    #[error("{id} depends on {on}, which was not applied")]
    PrerequisiteFailed { id: ResourceId, on: ResourceId },
}

impl GraphError {
    pub fn to_status(&self) -> StatusError {
        match self {
            GraphError::Cycle { members } => {
                StatusError::new(ErrorCode::GraphCycle, self.to_string()).with_resources(members.clone())
            }
            GraphError::Blocked { id, .. }
            | GraphError::MissingPrerequisite { id, .. }
            | GraphError::PrerequisiteFailed { id, .. } => {
                StatusError::for_resource(ErrorCode::DependencyBlocked, id, self.to_string())
            }
        }
    }
}

/// Result of ordering a graph: ready layers plus what was excluded and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOrder {
    /// Each layer depends only on earlier layers; members sorted by ResourceId.
    pub layers: Vec<Vec<ResourceId>>,
    /// One entry per strongly connected component, members sorted.
    pub cycles: Vec<Vec<ResourceId>>,
    /// Transitive dependents of a cycle, mapped to the cycle member they reach.
    pub blocked: BTreeMap<ResourceId, ResourceId>,
}

impl ApplyOrder {
    pub fn errors(&self) -> Vec<GraphError> {
        let cycles = self.cycles.iter().map(|members| GraphError::Cycle { members: members.clone() });
        let blocked = self.blocked.iter().map(|(id, on)| GraphError::Blocked { id: id.clone(), on: on.clone() });
        cycles.chain(blocked).collect()
    }

    /// Cycle members and their dependents.
    pub fn excluded(&self) -> BTreeSet<ResourceId> {
        self.cycles.iter().flatten().chain(self.blocked.keys()).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceId> {
        self.layers.iter().flatten()
    }

    /// Layers for deletion: dependents of cycles first, then cycle members, then the
    /// acyclic layers in reverse.
    pub fn deletion_layers(&self) -> Vec<Vec<ResourceId>> {
        let mut out = Vec::with_capacity(self.layers.len() + 2);
        if !self.blocked.is_empty() {
            out.push(self.blocked.keys().cloned().collect());
        }
        let mut members: Vec<ResourceId> = self.cycles.iter().flatten().cloned().collect();
        if !members.is_empty() {
            members.sort();
            out.push(members);
        }
        out.extend(self.layers.iter().rev().cloned());
        out
    }
}

pub struct DependencyGraph {
    graph: DiGraph<ResourceId, EdgeKind>,
    index: FxHashMap<ResourceId, NodeIndex>,
    external: BTreeMap<ResourceId, Vec<ObjectRef>>,
}

impl DependencyGraph {
    /// Build from nodes; duplicate ids keep the first occurrence. References that
    /// resolve to no node are recorded as external prerequisites.
    pub fn build<'a, N, I>(nodes: I) -> Self
    where
        N: GraphNode + 'a,
        I: IntoIterator<Item = &'a N>,
    {
        let mut graph = DiGraph::new();
        let mut index = FxHashMap::default();
        let mut pending: Vec<(ResourceId, NodeIndex, Vec<ObjectRef>)> = Vec::new();
        let mut crds: FxHashMap<(String, String), NodeIndex> = FxHashMap::default();
        let mut namespaces: FxHashMap<String, NodeIndex> = FxHashMap::default();

        for n in nodes {
            let Some(id) = n.node_id() else { continue };
            if index.contains_key(&id) {
                continue;
            }
            let ix = graph.add_node(id.clone());
            if id.is_crd() {
                if let Some(k) = defined_kind(n.payload()) {
                    crds.insert(k, ix);
                }
            }
            if id.is_namespace() {
                namespaces.insert(id.name.clone(), ix);
            }
            index.insert(id.clone(), ix);
            pending.push((id, ix, n.explicit_prerequisites()));
        }

        let by_ref: FxHashMap<ObjectRef, NodeIndex> = index.iter().map(|(id, ix)| (id.object_ref(), *ix)).collect();
        let mut external: BTreeMap<ResourceId, Vec<ObjectRef>> = BTreeMap::new();
        for (id, ix, refs) in pending {
            for r in refs {
                match by_ref.get(&r) {
                    Some(&from) => add_edge(&mut graph, from, ix, EdgeKind::DependsOn),
                    None => external.entry(id.clone()).or_default().push(r),
                }
            }
            if let Some(&ns) = id.namespace.as_ref().and_then(|ns| namespaces.get(ns)) {
                add_edge(&mut graph, ns, ix, EdgeKind::Namespace);
            }
            if let Some(&crd) = crds.get(&(id.group.clone(), id.kind.clone())) {
                add_edge(&mut graph, crd, ix, EdgeKind::CustomResource);
            }
        }
        debug!(nodes = graph.node_count(), edges = graph.edge_count(), external = external.len(), "dependency graph built");
        Self { graph, index, external }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// References of `id` that name no node in this graph.
    pub fn external_prerequisites(&self, id: &ResourceId) -> &[ObjectRef] {
        self.external.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct in-graph prerequisites of `id`, sorted.
    pub fn prerequisites(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, sorted.
    pub fn dependents(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &ResourceId, dir: Direction) -> Vec<ResourceId> {
        let Some(&ix) = self.index.get(id) else { return Vec::new() };
        let mut out: Vec<ResourceId> = self
            .graph
            .neighbors_directed(ix, dir)
            .filter(|n| *n != ix)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every resource that transitively depends on `id` (excluding `id` itself).
    pub fn dependents_closure(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(id) else { return out };
        let mut seen = FxHashSet::default();
        seen.insert(start);
        let mut queue = VecDeque::from([start]);
        while let Some(n) = queue.pop_front() {
            for next in self.graph.neighbors_directed(n, Direction::Outgoing) {
                if seen.insert(next) {
                    out.insert(self.graph[next].clone());
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// Layered topological order (Kahn). Cycle members and anything reachable from
    /// them are left out of the layers and reported instead.
    pub fn order(&self) -> ApplyOrder {
        let mut cycles: Vec<Vec<ResourceId>> = Vec::new();
        let mut excluded: FxHashSet<NodeIndex> = FxHashSet::default();
        for scc in tarjan_scc(&self.graph) {
            let cyclic = scc.len() > 1 || scc.first().is_some_and(|&n| self.graph.contains_edge(n, n));
            if cyclic {
                let mut members: Vec<ResourceId> = scc.iter().map(|&n| self.graph[n].clone()).collect();
                members.sort();
                excluded.extend(scc);
                cycles.push(members);
            }
        }
        cycles.sort();

        let mut blocked = BTreeMap::new();
        let mut queue: VecDeque<(NodeIndex, &ResourceId)> = VecDeque::new();
        for member in cycles.iter().flatten() {
            if let Some(&ix) = self.index.get(member) {
                queue.push_back((ix, member));
            }
        }
        while let Some((n, origin)) = queue.pop_front() {
            for next in self.graph.neighbors_directed(n, Direction::Outgoing) {
                if excluded.insert(next) {
                    blocked.insert(self.graph[next].clone(), origin.clone());
                    queue.push_back((next, origin));
                }
            }
        }

        let mut indegree: FxHashMap<NodeIndex, usize> = FxHashMap::default();
        for n in self.graph.node_indices().filter(|n| !excluded.contains(n)) {
            let d = self.graph.neighbors_directed(n, Direction::Incoming).filter(|p| !excluded.contains(p)).count();
            indegree.insert(n, d);
        }
        let mut layers: Vec<Vec<ResourceId>> = Vec::new();
        let mut ready: Vec<NodeIndex> = indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
        while !ready.is_empty() {
            ready.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            let mut next = Vec::new();
            for &n in &ready {
                for m in self.graph.neighbors_directed(n, Direction::Outgoing) {
                    if let Some(d) = indegree.get_mut(&m) {
                        *d = d.saturating_sub(1);
                        if *d == 0 {
                            next.push(m);
                        }
                    }
                }
            }
            layers.push(ready.iter().map(|&n| self.graph[n].clone()).collect());
            ready = next;
        }
        ApplyOrder { layers, cycles, blocked }
    }
}

fn add_edge(graph: &mut DiGraph<ResourceId, EdgeKind>, from: NodeIndex, to: NodeIndex, kind: EdgeKind) {
    if graph.find_edge(from, to).is_none() {
        graph.add_edge(from, to, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(v: Json) -> DeclaredResource {
        DeclaredResource::from_manifest(v, None).unwrap()
    }

    fn cm(name: &str, deps: &str) -> DeclaredResource {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}});
        if !deps.is_empty() {
            v["metadata"]["annotations"] = json!({"config.kubernetes.io/depends-on": deps});
        }
        decl(v)
    }

    fn names(layer: &[ResourceId]) -> Vec<&str> {
        layer.iter().map(|id| id.name.as_str()).collect()
    }

    #[test]
    fn namespace_precedes_its_objects_implicitly() {
        let set = vec![cm("a", ""), decl(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns"}}))];
        let g = DependencyGraph::build(&set);
        let order = g.order();
        assert_eq!(order.layers.len(), 2);
        assert_eq!(names(&order.layers[0]), vec!["ns"]);
        assert_eq!(names(&order.layers[1]), vec!["a"]);
    }

    #[test]
    fn crd_precedes_custom_resources_of_its_kind() {
        let set = vec![
            decl(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "ns"}})),
            decl(json!({
                "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
                "metadata": {"name": "widgets.example.com"},
                "spec": {"group": "example.com", "names": {"kind": "Widget", "plural": "widgets"}}
            })),
        ];
        let order = DependencyGraph::build(&set).order();
        assert_eq!(names(&order.layers[0]), vec!["widgets.example.com"]);
        assert_eq!(names(&order.layers[1]), vec!["w"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let set = vec![cm("a", "/namespaces/ns/ConfigMap/a"), cm("b", "")];
        let order = DependencyGraph::build(&set).order();
        assert_eq!(order.cycles.len(), 1);
        assert_eq!(names(&order.cycles[0]), vec!["a"]);
        assert_eq!(order.layers, vec![vec![set[1].id.clone()]]);
    }

    #[test]
    fn unresolved_references_are_external() {
        let set = vec![cm("a", "/namespaces/other/Secret/creds")];
        let g = DependencyGraph::build(&set);
        let ext = g.external_prerequisites(&set[0].id);
        assert_eq!(ext.len(), 1);
        assert_eq!(ext[0].kind, "Secret");
        assert_eq!(g.order().layers.len(), 1);
    }

    #[test]
    fn closure_and_direct_neighbours() {
        let set = vec![cm("a", ""), cm("b", "/namespaces/ns/ConfigMap/a"), cm("c", "/namespaces/ns/ConfigMap/b")];
        let g = DependencyGraph::build(&set);
        let closure: Vec<String> = g.dependents_closure(&set[0].id).into_iter().map(|i| i.name).collect();
        assert_eq!(closure, vec!["b", "c"]);
        assert_eq!(g.prerequisites(&set[2].id), vec![set[1].id.clone()]);
        assert_eq!(g.dependents(&set[0].id), vec![set[1].id.clone()]);
        assert!(g.prerequisites(&set[0].id).is_empty());
    }

    #[test]
    fn errors_map_to_status_codes() {
        let set = vec![cm("x", "/namespaces/ns/ConfigMap/y"), cm("y", "/namespaces/ns/ConfigMap/x"), cm("z", "/namespaces/ns/ConfigMap/x")];
        let order = DependencyGraph::build(&set).order();
        let statuses: Vec<StatusError> = order.errors().iter().map(GraphError::to_status).collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].code, ErrorCode::GraphCycle);
        assert_eq!(statuses[0].resources, vec![set[0].id.clone(), set[1].id.clone()]);
        assert_eq!(statuses[1].code, ErrorCode::DependencyBlocked);
        assert_eq!(statuses[1].resources, vec![set[2].id.clone()]);
    }
}
