//! Per-scope sync status: the outcome of the latest cycle, never an accumulation.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use conform_apply::OpCounts;
use conform_core::{ErrorCode, ScopeId, StatusError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub scope: ScopeId,
    /// Revision of the last cycle that ran; `None` before the first one.
    pub revision: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Keyed by kind (`v1/ConfigMap`).
    pub counts: BTreeMap<String, OpCounts>,
    pub errors: Vec<StatusError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_generation: Option<u64>,
}

impl SyncStatus {
    pub fn pending(scope: ScopeId) -> Self {
        Self {
            scope,
            revision: None,
            last_synced_at: None,
            counts: BTreeMap::new(),
            errors: Vec::new(),
            inventory_generation: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors_with(&self, code: ErrorCode) -> impl Iterator<Item = &StatusError> {
        self.errors.iter().filter(move |e| e.code == code)
    }

    /// Plain-text rendering for terminals.
    pub fn render(&self) -> String {
        let mut s = format!(
            "scope {}  revision {}  synced {}\n",
            self.scope,
            self.revision.as_deref().unwrap_or("-"),
            self.last_synced_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string()),
        );
        for (kind, c) in &self.counts {
            s.push_str(&format!(
                "  {:<40} created {:>3}  updated {:>3}  deleted {:>3}  released {:>3}\n",
                kind, c.created, c.updated, c.deleted, c.released
            ));
        }
        for e in &self.errors {
            s.push_str(&format!("  {} {}\n", e.code, e.message));
        }
        s
    }
}

/// Publishes status with a pointer swap plus a bump on a watch channel, the same
/// way the last-declared cache does.
pub struct StatusBoard {
    current: Arc<ArcSwap<SyncStatus>>,
    tx: watch::Sender<u64>,
}

impl StatusBoard {
    pub fn new(scope: ScopeId) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self { current: Arc::new(ArcSwap::from_pointee(SyncStatus::pending(scope))), tx }
    }

    pub fn publish(&self, status: SyncStatus) -> Arc<SyncStatus> {
        let next = Arc::new(status);
        self.current.store(Arc::clone(&next));
        self.tx.send_modify(|n| *n += 1);
        next
    }

    pub fn current(&self) -> Arc<SyncStatus> {
        self.current.load_full()
    }

    pub fn handle(&self) -> StatusHandle {
        StatusHandle { current: Arc::clone(&self.current), rx: self.tx.subscribe() }
    }
}

#[derive(Clone)]
pub struct StatusHandle {
    current: Arc<ArcSwap<SyncStatus>>,
    rx: watch::Receiver<u64>,
}

impl StatusHandle {
    pub fn current(&self) -> Arc<SyncStatus> {
        self.current.load_full()
    }

    /// Wait for the next publish; `None` once the board is gone.
    pub async fn changed(&mut self) -> Option<Arc<SyncStatus>> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_replaces_and_notifies() {
        let board = StatusBoard::new(ScopeId::root("platform"));
        let mut h = board.handle();
        assert!(h.current().revision.is_none());

        let mut s = SyncStatus::pending(ScopeId::root("platform"));
        s.revision = Some("abc".into());
        s.errors.push(StatusError::new(ErrorCode::Source, "boom"));
        board.publish(s);
        let seen = h.changed().await.unwrap();
        assert_eq!(seen.revision.as_deref(), Some("abc"));
        assert_eq!(seen.errors_with(ErrorCode::Source).count(), 1);
        assert!(!seen.is_healthy());
        assert!(seen.render().contains("E1001 boom"));

        let json = serde_json::to_value(&*seen).unwrap();
        assert_eq!(json["scope"], ":root_platform");
        assert_eq!(json["errors"][0]["code"], "E1001");
    }
}
