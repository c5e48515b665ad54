//! Field-scoped merge: set what this scope declares now, clear what it declared
//! before and no longer does, leave every other field alone.

use std::cmp::Ordering;

use conform_core::{
    get_path, is_element_segment, remove_path, segment_index, set_path, DeclaredResource, FieldPath, FieldSet, Json,
    LiveResource,
};
use conform_ownership::OwnershipRegistry;
use serde::{Deserialize, Serialize};

/// Metadata the server owns; never sent on create.
const SERVER_METADATA: [&str; 6] = ["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields", "selfLink"];

/// Object to send when nothing exists yet: the declared payload plus our stamp.
pub fn object_for_create(decl: &DeclaredResource, fields: &FieldSet, registry: &OwnershipRegistry) -> Json {
    let mut obj = decl.payload.clone();
    if let Some(top) = obj.as_object_mut() {
        top.remove("status");
    }
    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in SERVER_METADATA {
            meta.remove(k);
        }
    }
    registry.stamp(&mut obj, &decl.id, fields);
    obj
}

/// Merge `decl` into the live object. `previous` is the fingerprint this scope
/// stamped last time, if the object is ours. The live resourceVersion is kept so the
/// resulting update is rejected if the object changed since it was read.
pub fn merge_declared(
    live: &LiveResource,
    decl: &DeclaredResource,
    previous: Option<&FieldSet>,
    fields: &FieldSet,
    registry: &OwnershipRegistry,
) -> Json {
    let mut out = live.raw().clone();
    if let Some(prev) = previous {
        let mut targets: Vec<&[String]> = prev.withdrawn(fields).map(|p| removal_target(p, fields)).collect();
        targets.sort_by(|a, b| path_order(a, b));
        targets.dedup();
        // deepest and highest positions first, so earlier positions stay valid
        for path in targets.into_iter().rev() {
            remove_path(&mut out, path);
        }
    }
    for path in fields.iter() {
        if let Some(v) = get_path(&decl.payload, path) {
            set_path(&mut out, path, v.clone());
        }
    }
    registry.stamp(&mut out, &decl.id, fields);
    out
}

/// A withdrawn leaf inside a list element nothing declares any more takes the
/// whole element with it; otherwise only the leaf goes.
fn removal_target<'a>(path: &'a [String], current: &FieldSet) -> &'a [String] {
    for end in 1..=path.len() {
        let prefix = &path[..end];
        if is_element_segment(&path[end - 1]) && !current.iter().any(|p| p.starts_with(prefix)) {
            return prefix;
        }
    }
    path
}

/// Path order with positional segments compared as numbers.
fn path_order(a: &[String], b: &[String]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let o = match (segment_index(x), segment_index(y)) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => x.cmp(y),
        };
        if o != Ordering::Equal {
            return o;
        }
    }
    a.len().cmp(&b.len())
}

/// Declared paths whose live value differs from the declaration.
pub fn drifted_fields<'a>(live: &LiveResource, decl: &DeclaredResource, fields: &'a FieldSet) -> Vec<&'a FieldPath> {
    fields.iter().filter(|p| get_path(live.raw(), p) != get_path(&decl.payload, p)).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Drop server-populated noise before diffing.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Rough shape of a change from `base` to `target`, for logs and plans.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
