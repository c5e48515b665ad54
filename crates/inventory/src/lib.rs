//! conform inventory: which resources a scope is responsible for.
//!
//! Stored as one ConfigMap per scope (`conform-inventory-<scope name>`) with data
//! keys `owner`, `generation` and `entries`. Every write is a read-modify-write
//! carrying the read's resourceVersion; version conflicts retry the whole cycle.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use conform_core::{keys, ClusterError, ErrorCode, Gvk, Json, LiveResource, ResourceId, ScopeId, StatusError};
use conform_kubehub::{retry, Backoff, ClusterClient};
use serde_json::json;
use tracing::{debug, info};

pub const NAME_PREFIX: &str = "conform-inventory-";
pub const DEFAULT_NAMESPACE: &str = "conform-system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub owner: ScopeId,
    /// Bumped on every write.
    pub generation: u64,
    pub entries: BTreeSet<ResourceId>,
    resource_version: Option<String>,
}

impl Inventory {
    pub fn empty(owner: ScopeId) -> Self {
        Self { owner, generation: 0, entries: BTreeSet::new(), resource_version: None }
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `None` until the inventory has been persisted.
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("inventory {name}: still conflicting after {attempts} read-modify-write attempts")]
    ConflictRetriesExhausted { name: String, attempts: u32 },
    #[error("inventory {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("inventory: {0}")]
    Cluster(#[from] ClusterError),
}

impl InventoryError {
    pub fn to_status(&self) -> StatusError {
        let code = match self {
            InventoryError::ConflictRetriesExhausted { .. } => ErrorCode::InventoryConflict,
            InventoryError::Corrupt { .. } => ErrorCode::InventoryInvalid,
            InventoryError::Cluster(_) => ErrorCode::ClusterApi,
        };
        StatusError::new(code, self.to_string())
    }
}

pub struct InventoryStore {
    client: Arc<dyn ClusterClient>,
    scope: ScopeId,
    id: ResourceId,
    backoff: Backoff,
}

impl InventoryStore {
    /// Namespace scopes keep their inventory in their own namespace; root scopes in
    /// `root_namespace`.
    pub fn new(client: Arc<dyn ClusterClient>, scope: ScopeId, root_namespace: &str, backoff: Backoff) -> Self {
        let namespace = scope.namespace().unwrap_or(root_namespace).to_string();
        let id = ResourceId::new(
            &Gvk::new("", "v1", "ConfigMap"),
            Some(&namespace),
            format!("{}{}", NAME_PREFIX, scope.name()),
        );
        Self { client, scope, id, backoff }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }

    pub async fn load(&self) -> Result<Inventory, InventoryError> {
        let live = retry(&self.backoff, "inventory.get", || self.client.get(&self.id)).await?;
        match live {
            None => Ok(Inventory::empty(self.scope.clone())),
            Some(live) => self.decode(&live),
        }
    }

    /// Persist `entries`. Skips the write when the stored set already matches.
    pub async fn save(&self, entries: &BTreeSet<ResourceId>) -> Result<Inventory, InventoryError> {
        let attempts = self.backoff.max_attempts.max(1);
        match retry(&self.backoff, "inventory.save", || self.save_once(entries)).await {
            Ok(Ok(inv)) => Ok(inv),
            Ok(Err(e)) => Err(e),
            Err(ClusterError::Conflict(_) | ClusterError::AlreadyExists(_)) => {
                Err(InventoryError::ConflictRetriesExhausted { name: self.id.name.clone(), attempts })
            }
            Err(e) => Err(InventoryError::Cluster(e)),
        }
    }

    /// One read-modify-write. Cluster errors surface in the outer result so they can
    /// be retried; a corrupt inventory is terminal and rides in the inner one.
    async fn save_once(&self, entries: &BTreeSet<ResourceId>) -> Result<Result<Inventory, InventoryError>, ClusterError> {
        let current = match self.client.get(&self.id).await? {
            None => None,
            Some(live) => match self.decode(&live) {
                Ok(inv) => Some(inv),
                Err(e) => return Ok(Err(e)),
            },
        };
        if let Some(cur) = current.as_ref().filter(|c| &c.entries == entries) {
            debug!(inventory = %self.id, generation = cur.generation, "inventory unchanged");
            return Ok(Ok(cur.clone()));
        }
        let next = Inventory {
            owner: self.scope.clone(),
            generation: current.as_ref().map_or(0, |c| c.generation) + 1,
            entries: entries.clone(),
            resource_version: current.as_ref().and_then(|c| c.resource_version.clone()),
        };
        let obj = self.encode(&next)?;
        let written = match current {
            Some(_) => self.client.update(&obj).await?,
            None => self.client.create(&obj).await?,
        };
        info!(inventory = %self.id, generation = next.generation, entries = next.len(), "inventory written");
        Ok(Ok(Inventory { resource_version: written.resource_version().map(str::to_string), ..next }))
    }

    fn corrupt(&self, reason: impl Into<String>) -> InventoryError {
        InventoryError::Corrupt { name: self.id.name.clone(), reason: reason.into() }
    }

    fn decode(&self, live: &LiveResource) -> Result<Inventory, InventoryError> {
        let data = live.raw().get("data").cloned().unwrap_or(Json::Null);
        let field = |k: &str| data.get(k).and_then(|v| v.as_str());
        let owner = field("owner").ok_or_else(|| self.corrupt("missing owner"))?;
        let owner = ScopeId::parse_manager(owner).ok_or_else(|| self.corrupt(format!("bad owner {:?}", owner)))?;
        if owner != self.scope {
            return Err(self.corrupt(format!("owned by {}, expected {}", owner, self.scope)));
        }
        let generation = field("generation")
            .unwrap_or("0")
            .parse::<u64>()
            .map_err(|e| self.corrupt(format!("bad generation: {}", e)))?;
        let entries: Vec<ResourceId> = match field("entries") {
            None => Vec::new(),
            Some(raw) => serde_json::from_str(raw).map_err(|e| self.corrupt(format!("bad entries: {}", e)))?,
        };
        Ok(Inventory {
            owner,
            generation,
            entries: entries.into_iter().collect(),
            resource_version: live.resource_version().map(str::to_string),
        })
    }

    fn encode(&self, inv: &Inventory) -> Result<Json, ClusterError> {
        let entries: Vec<&ResourceId> = inv.entries.iter().collect();
        let entries = serde_json::to_string(&entries).map_err(|e| ClusterError::Other(e.to_string()))?;
        let mut obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": self.id.name,
                "namespace": self.id.namespace,
            },
            "data": {
                "owner": inv.owner.manager(),
                "generation": inv.generation.to_string(),
                "entries": entries,
            }
        });
        obj["metadata"]["labels"][keys::INVENTORY_LABEL] = json!("true");
        obj["metadata"]["annotations"][keys::INVENTORY_OWNER] = json!(inv.owner.manager());
        if let Some(rv) = &inv.resource_version {
            obj["metadata"]["resourceVersion"] = Json::String(rv.clone());
        }
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_failure_has_its_own_status_code() {
        let name = || "conform-inventory-platform".to_string();
        let cases = [
            (InventoryError::ConflictRetriesExhausted { name: name(), attempts: 5 }, "E2010"),
            (InventoryError::Corrupt { name: name(), reason: "entries is not a list".into() }, "E2013"),
            (InventoryError::Cluster(ClusterError::Forbidden("configmaps is forbidden".into())), "E2014"),
        ];
        for (err, code) in cases {
            let status = err.to_status();
            assert_eq!(status.code.as_str(), code, "{}", err);
            assert_eq!(status.message, err.to_string());
        }
    }
}
