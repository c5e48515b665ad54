//! Reconciler settings. Every knob has a default; the binary overrides them from
//! flags and `CONFORM_*` environment variables.

use std::time::Duration;

use conform_core::ScopeId;
use conform_inventory::DEFAULT_NAMESPACE;
use conform_kubehub::Backoff;
use conform_ownership::ConflictPolicy;
use conform_remediator::RemediatorConfig;

pub const DEFAULT_POLL: Duration = Duration::from_secs(15);
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub scope: ScopeId,
    /// How often the source is asked for a new revision.
    pub poll_period: Duration,
    /// A cycle runs at least this often even without a new revision.
    pub resync_period: Duration,
    pub policy: ConflictPolicy,
    pub backoff: Backoff,
    /// Where root scopes keep their inventory.
    pub inventory_namespace: String,
    pub remediator: RemediatorConfig,
}

impl ReconcilerConfig {
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            poll_period: DEFAULT_POLL,
            resync_period: DEFAULT_RESYNC,
            policy: ConflictPolicy::default(),
            backoff: Backoff::default(),
            inventory_namespace: DEFAULT_NAMESPACE.to_string(),
            remediator: RemediatorConfig::default(),
        }
    }

    /// Use the same backoff for apply and remediation calls.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.remediator.backoff = backoff.clone();
        self.backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ReconcilerConfig::new(ScopeId::root("platform"));
        assert_eq!(c.poll_period, Duration::from_secs(15));
        assert_eq!(c.resync_period, Duration::from_secs(3600));
        assert_eq!(c.inventory_namespace, "conform-system");
        assert!(!c.policy.root_preempts_namespace);
        assert_eq!(c.backoff.max_attempts, 6);
        assert_eq!(c.remediator.tick, Duration::from_millis(50));
        assert_eq!(c.remediator.flip_threshold, 3);

        let c = c.with_backoff(Backoff::immediate(2));
        assert_eq!(c.remediator.backoff, Backoff::immediate(2));
    }
}
