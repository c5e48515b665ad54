//! Annotation and label keys stamped on, or read from, managed objects.

/// Scope currently permitted to manage the object (`ScopeId` manager form).
pub const MANAGER: &str = "conform.dev/manager";
/// JSON fingerprint of the fields the manager last declared.
pub const DECLARED_FIELDS: &str = "conform.dev/declared-fields";
/// Identity the stamp was written for.
pub const RESOURCE_ID: &str = "conform.dev/resource-id";
/// Label marking objects that carry a conform stamp.
pub const MANAGED_LABEL: &str = "conform.dev/managed";
pub const MANAGED_ENABLED: &str = "enabled";

/// Management directive; `disabled` releases the object without deleting it.
pub const MANAGEMENT: &str = "conform.dev/management";
pub const MANAGEMENT_DISABLED: &str = "disabled";

/// Lifecycle directive; `detach` means never prune.
pub const LIFECYCLE_DELETION: &str = "client.lifecycle.config.k8s.io/deletion";
pub const LIFECYCLE_DETACH: &str = "detach";

/// Objects marked local-config are never sent to the cluster.
pub const LOCAL_CONFIG: &str = "config.kubernetes.io/local-config";

/// Comma-separated depends-on references.
pub const DEPENDS_ON: &str = "config.kubernetes.io/depends-on";

/// Label carried by inventory objects.
pub const INVENTORY_LABEL: &str = "conform.dev/inventory";
/// Annotation on inventory objects naming the owning scope.
pub const INVENTORY_OWNER: &str = "conform.dev/inventory-owner";

/// Keys owned by the stamp itself; never part of a declared-fields fingerprint.
pub const STAMP_ANNOTATIONS: [&str; 3] = [MANAGER, DECLARED_FIELDS, RESOURCE_ID];
