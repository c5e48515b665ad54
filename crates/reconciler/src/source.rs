//! Where declared sets come from. Fetching and rendering belong to an external
//! builder; [`DirSource`] reads an already-rendered manifest directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use conform_core::{DeclaredResource, ErrorCode, Json, StatusError};
use serde::Deserialize;
use tracing::debug;

/// One revision of a scope's declared resources.
#[derive(Debug, Clone, Default)]
pub struct DeclaredSet {
    pub revision: String,
    pub resources: Vec<DeclaredResource>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("source: {0}")]
    Other(String),
}

impl SourceError {
    pub fn to_status(&self) -> StatusError {
        StatusError::new(ErrorCode::Source, self.to_string())
    }
}

#[async_trait]
pub trait DeclaredSource: Send + Sync {
    async fn fetch(&self) -> Result<DeclaredSet, SourceError>;
}

fn max_manifest_bytes() -> usize {
    std::env::var("CONFORM_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB per file
}

fn max_manifest_nodes() -> usize {
    std::env::var("CONFORM_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|c| walk(c, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|c| walk(c, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// 64-bit FNV-1a, fed file names and contents in path order.
struct Fnv64(u64);

impl Fnv64 {
    fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
}

/// Reads every `*.yaml`, `*.yml` and `*.json` file under a directory, recursively,
/// in path order. Files may hold several documents; empty documents are skipped.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
    default_namespace: Option<String>,
}

impl DirSource {
    /// `default_namespace` is filled into manifests that leave `metadata.namespace`
    /// empty; namespace scopes pass their own namespace.
    pub fn new(root: impl Into<PathBuf>, default_namespace: Option<String>) -> Self {
        Self { root: root.into(), default_namespace }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Synchronous read, for callers without a runtime.
    pub fn load(&self) -> Result<DeclaredSet, SourceError> {
        let mut files = Vec::new();
        collect_files(&self.root, &mut files)?;
        files.sort();

        let mut hash = Fnv64::new();
        let mut resources: Vec<DeclaredResource> = Vec::new();
        let mut seen = BTreeSet::new();
        for path in &files {
            let text = std::fs::read_to_string(path).map_err(|source| SourceError::Io { path: path.clone(), source })?;
            let rel = path.strip_prefix(&self.root).unwrap_or(path);
            hash.write(rel.to_string_lossy().as_bytes());
            hash.write(&[0]);
            hash.write(text.as_bytes());

            let decoded = decode_file(&text, self.default_namespace.as_deref())
                .map_err(|e| SourceError::Decode { path: path.clone(), message: format!("{:#}", e) })?;
            for r in decoded {
                if !seen.insert(r.id.clone()) {
                    return Err(SourceError::Decode { path: path.clone(), message: format!("{} is declared more than once", r.id) });
                }
                resources.push(r);
            }
        }
        debug!(root = %self.root.display(), files = files.len(), resources = resources.len(), "manifest directory read");
        Ok(DeclaredSet { revision: format!("{:016x}", hash.0), resources })
    }
}

#[async_trait]
impl DeclaredSource for DirSource {
    async fn fetch(&self) -> Result<DeclaredSet, SourceError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.load())
            .await
            .map_err(|e| SourceError::Other(format!("manifest reader task failed: {}", e)))?
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SourceError> {
    let io = |source| SourceError::Io { path: dir.to_path_buf(), source };
    for entry in std::fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")) {
            out.push(path);
        }
    }
    Ok(())
}

fn decode_file(text: &str, default_namespace: Option<&str>) -> anyhow::Result<Vec<DeclaredResource>> {
    let max_bytes = max_manifest_bytes();
    if text.len() > max_bytes {
        return Err(anyhow!("manifest file too large (>{} bytes)", max_bytes));
    }
    let max_nodes = max_manifest_nodes();
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("converting document {} to JSON", i + 1))?;
        if node_budget_exceeded(&json, max_nodes) {
            return Err(anyhow!("document {} too complex (>{} nodes)", i + 1, max_nodes));
        }
        let r = DeclaredResource::from_manifest(json, default_namespace).with_context(|| format!("document {}", i + 1))?;
        out.push(r);
    }
    Ok(out)
}
