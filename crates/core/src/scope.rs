use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority class of a reconciler scope. Root scopes may be configured to take
/// precedence over namespace scopes; scopes of the same class never preempt each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityClass {
    Root,
    Namespace,
}

/// Identity of one reconciler: root (cluster-wide) or bound to a namespace.
///
/// Rendered as `:root_<name>` or `<namespace>_<name>`, which is the value written
/// to the manager annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ScopeId {
    namespace: Option<String>,
    name: String,
}

const ROOT_PREFIX: &str = ":root_";

impl ScopeId {
    pub fn root(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace a namespace scope is bound to; `None` for root scopes.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.namespace.is_none()
    }

    pub fn class(&self) -> PriorityClass {
        if self.is_root() { PriorityClass::Root } else { PriorityClass::Namespace }
    }

    pub fn manager(&self) -> String {
        match &self.namespace {
            None => format!("{}{}", ROOT_PREFIX, self.name),
            Some(ns) => format!("{}_{}", ns, self.name),
        }
    }

    /// Parse a manager annotation value. Namespace names cannot contain `_`, so the
    /// first underscore separates namespace from reconciler name.
    pub fn parse_manager(s: &str) -> Option<Self> {
        if let Some(name) = s.strip_prefix(ROOT_PREFIX) {
            return (!name.is_empty()).then(|| Self::root(name));
        }
        let (ns, name) = s.split_once('_')?;
        if ns.is_empty() || name.is_empty() || ns.starts_with(':') {
            return None;
        }
        Some(Self::namespaced(ns, name))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.manager())
    }
}

impl From<ScopeId> for String {
    fn from(s: ScopeId) -> Self {
        s.manager()
    }
}

impl TryFrom<String> for ScopeId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ScopeId::parse_manager(&s).ok_or_else(|| format!("invalid scope id: {}", s))
    }
}
