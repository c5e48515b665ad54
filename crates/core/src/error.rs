use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Errors returned by cluster API calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency precondition failed (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Network failure, timeout, throttling or server busy.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("internal: {0}")]
    Other(String),
}

impl ClusterError {
    /// Retryable errors are worth another attempt after a backoff; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::AlreadyExists(_) | ClusterError::Unavailable(_))
    }
}

/// Stable codes carried by every status error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E1001")]
    Source,
    #[serde(rename = "E1010")]
    GraphCycle,
    #[serde(rename = "E1011")]
    DependencyBlocked,
    #[serde(rename = "E1012")]
    DependencyMismatch,
    #[serde(rename = "E1020")]
    ScopeViolation,
    #[serde(rename = "E1060")]
    ManagementConflict,
    #[serde(rename = "E2009")]
    Apply,
    #[serde(rename = "E2010")]
    InventoryConflict,
    #[serde(rename = "E2011")]
    Prune,
    #[serde(rename = "E2012")]
    Remediation,
    #[serde(rename = "E2013")]
    InventoryInvalid,
    #[serde(rename = "E2014")]
    ClusterApi,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Source => "E1001",
            ErrorCode::GraphCycle => "E1010",
            ErrorCode::DependencyBlocked => "E1011",
            ErrorCode::DependencyMismatch => "E1012",
            ErrorCode::ScopeViolation => "E1020",
            ErrorCode::ManagementConflict => "E1060",
            ErrorCode::Apply => "E2009",
            ErrorCode::InventoryConflict => "E2010",
            ErrorCode::Prune => "E2011",
            ErrorCode::Remediation => "E2012",
            ErrorCode::InventoryInvalid => "E2013",
            ErrorCode::ClusterApi => "E2014",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, user-visible error: code, message and the offending resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceId>,
}

impl StatusError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), resources: Vec::new() }
    }

    pub fn for_resource(code: ErrorCode, id: &ResourceId, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), resources: vec![id.clone()] }
    }

    pub fn with_resources(mut self, mut ids: Vec<ResourceId>) -> Self {
        ids.sort();
        ids.dedup();
        self.resources = ids;
        self
    }

    pub fn names(&self, id: &ResourceId) -> bool {
        self.resources.iter().any(|r| r == id)
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if !self.resources.is_empty() {
            let ids: Vec<String> = self.resources.iter().map(|r| r.to_string()).collect();
            write!(f, " [{}]", ids.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Gvk;

    #[test]
    fn retryable_classification() {
        assert!(ClusterError::Conflict("rv".into()).is_retryable());
        assert!(ClusterError::Unavailable("eof".into()).is_retryable());
        assert!(!ClusterError::Invalid("spec".into()).is_retryable());
        assert!(!ClusterError::Forbidden("rbac".into()).is_retryable());
        assert!(!ClusterError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn codes_serialize_to_stable_strings() {
        let e = StatusError::new(ErrorCode::ManagementConflict, "owned elsewhere");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["code"], "E1060");
        assert!(v.get("resources").is_none());
        assert_eq!(ErrorCode::GraphCycle.to_string(), "E1010");
        for code in [ErrorCode::InventoryConflict, ErrorCode::InventoryInvalid, ErrorCode::ClusterApi] {
            assert_eq!(serde_json::to_value(code).unwrap(), code.as_str());
        }
    }

    #[test]
    fn with_resources_sorts_and_dedups() {
        let g = Gvk::new("", "v1", "ConfigMap");
        let a = ResourceId::new(&g, Some("ns"), "a");
        let b = ResourceId::new(&g, Some("ns"), "b");
        let e = StatusError::new(ErrorCode::GraphCycle, "cycle").with_resources(vec![b.clone(), a.clone(), b.clone()]);
        assert_eq!(e.resources, vec![a.clone(), b]);
        assert!(e.names(&a));
        assert!(e.to_string().starts_with("E1010: cycle ["));
    }
}
