//! conform ownership registry.
//!
//! Ownership lives on each live object as a stamp (manager annotation, declared
//! fields fingerprint, resource-id annotation, managed label). A claim is decided
//! from the stamp read in the same get that precedes every write; there is no
//! separate lock or lookup.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use conform_core::{keys, ErrorCode, FieldSet, Json, LiveResource, PriorityClass, ResourceId, ScopeId, StatusError};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Unowned,
    /// Already ours.
    Refresh,
    /// Taken from a namespace scope under `root_preempts_namespace`.
    Preempted { previous: ScopeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Granted(Grant),
    Denied { owner: ScopeId },
}

impl Claim {
    pub fn is_granted(&self) -> bool {
        matches!(self, Claim::Granted(_))
    }
}

/// How two scopes of the same priority class settle a contested object. Only
/// `Deny` exists: both sides report the conflict and neither overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameClassPolicy {
    #[default]
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    /// Let a root scope take objects currently managed by a namespace scope.
    #[serde(default)]
    pub root_preempts_namespace: bool,
    #[serde(default)]
    pub same_class: SameClassPolicy,
}

/// Claim decision for `claimant` against the current owner.
pub fn resolve(claimant: &ScopeId, owner: Option<&ScopeId>, policy: &ConflictPolicy) -> Claim {
    match owner {
        None => Claim::Granted(Grant::Unowned),
        Some(o) if o == claimant => Claim::Granted(Grant::Refresh),
        Some(o)
            if policy.root_preempts_namespace
                && claimant.class() == PriorityClass::Root
                && o.class() == PriorityClass::Namespace =>
        {
            Claim::Granted(Grant::Preempted { previous: o.clone() })
        }
        Some(o) => match policy.same_class {
            SameClassPolicy::Deny => Claim::Denied { owner: o.clone() },
        },
    }
}

pub fn conflict_error(id: &ResourceId, claimant: &ScopeId, owner: &ScopeId) -> StatusError {
    StatusError::for_resource(
        ErrorCode::ManagementConflict,
        id,
        format!(
            "{} is declared by {} but managed by {}; remove the declaration from one of them",
            id, claimant, owner
        ),
    )
}

/// Per-scope view of the ownership protocol.
#[derive(Debug, Clone)]
pub struct OwnershipRegistry {
    scope: ScopeId,
    policy: ConflictPolicy,
}

impl OwnershipRegistry {
    pub fn new(scope: ScopeId, policy: ConflictPolicy) -> Self {
        Self { scope, policy }
    }

    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Decide a claim from the live object's stamp. A missing object, or a manager
    /// value that does not parse as a scope, counts as unowned.
    pub fn claim(&self, live: Option<&LiveResource>) -> Claim {
        let owner = live.and_then(LiveResource::manager);
        let claim = resolve(&self.scope, owner.as_ref(), &self.policy);
        if let Claim::Denied { owner } = &claim {
            counter!("conform_ownership_denied_total", 1u64, "scope" => self.scope.manager());
            debug!(scope = %self.scope, owner = %owner, id = ?live.and_then(LiveResource::id), "claim denied");
        }
        claim
    }

    /// Whether a claim on `live` would be refused, without counting or logging it.
    pub fn held_elsewhere(&self, live: Option<&LiveResource>) -> bool {
        let owner = live.and_then(LiveResource::manager);
        matches!(resolve(&self.scope, owner.as_ref(), &self.policy), Claim::Denied { .. })
    }

    pub fn owns(&self, live: &LiveResource) -> bool {
        live.manager().as_ref() == Some(&self.scope)
    }

    /// Write this scope's stamp onto an outgoing object.
    pub fn stamp(&self, obj: &mut Json, id: &ResourceId, fields: &FieldSet) {
        let Some(meta) = metadata_mut(obj) else { return };
        if let Some(annotations) = child_map(meta, "annotations") {
            annotations.insert(keys::MANAGER.into(), Json::String(self.scope.manager()));
            annotations.insert(keys::DECLARED_FIELDS.into(), Json::String(fields.to_annotation()));
            annotations.insert(keys::RESOURCE_ID.into(), Json::String(id.to_string()));
        }
        if let Some(labels) = child_map(meta, "labels") {
            labels.insert(keys::MANAGED_LABEL.into(), Json::String(keys::MANAGED_ENABLED.into()));
        }
    }

    /// Remove this scope's stamp, leaving everything else as is. Returns whether the
    /// object changed; objects stamped by another scope are left alone.
    pub fn release(&self, obj: &mut Json) -> bool {
        let live = LiveResource::new(obj.clone());
        if live.manager().is_some() && !self.owns(&live) {
            return false;
        }
        let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) else { return false };
        let mut changed = false;
        if let Some(annotations) = meta.get_mut("annotations").and_then(Json::as_object_mut) {
            for key in keys::STAMP_ANNOTATIONS {
                changed |= annotations.remove(key).is_some();
            }
        }
        if let Some(labels) = meta.get_mut("labels").and_then(Json::as_object_mut) {
            changed |= labels.remove(keys::MANAGED_LABEL).is_some();
        }
        changed
    }
}

fn metadata_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    let top = obj.as_object_mut()?;
    let meta = top.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if !meta.is_object() {
        *meta = Json::Object(Map::new());
    }
    meta.as_object_mut()
}

fn child_map<'a>(meta: &'a mut Map<String, Json>, key: &str) -> Option<&'a mut Map<String, Json>> {
    let v = meta.entry(key).or_insert_with(|| Json::Object(Map::new()));
    if !v.is_object() {
        *v = Json::Object(Map::new());
    }
    v.as_object_mut()
}

/// Tracks ownership changes per object. Repeated alternation inside the window is
/// a standing conflict: report it, stop correcting.
#[derive(Debug)]
pub struct ConflictTracker {
    window: Duration,
    threshold: usize,
    history: FxHashMap<ResourceId, VecDeque<(Instant, Option<ScopeId>)>>,
}

pub const FLIP_THRESHOLD: usize = 3;
pub const FLIP_WINDOW: Duration = Duration::from_secs(60);

impl Default for ConflictTracker {
    fn default() -> Self {
        Self::new(FLIP_WINDOW, FLIP_THRESHOLD)
    }
}

impl ConflictTracker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self { window, threshold: threshold.max(1), history: FxHashMap::default() }
    }

    /// Record the owner seen at `now`; returns true once the object has changed
    /// hands at least `threshold` times within the window.
    pub fn observe(&mut self, id: &ResourceId, owner: Option<&ScopeId>, now: Instant) -> bool {
        let h = self.history.entry(id.clone()).or_default();
        if h.back().map(|(_, o)| o.as_ref()) != Some(owner) {
            h.push_back((now, owner.cloned()));
        }
        while let Some((t, _)) = h.front() {
            if now.saturating_duration_since(*t) > self.window && h.len() > 1 {
                h.pop_front();
            } else {
                break;
            }
        }
        h.len().saturating_sub(1) >= self.threshold
    }

    pub fn clear(&mut self, id: &ResourceId) {
        self.history.remove(id);
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}
