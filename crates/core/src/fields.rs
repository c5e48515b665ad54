//! Declared-fields fingerprint: the exact set of leaf paths a scope declared.
//!
//! Objects are descended key by key. Lists of objects are descended element by
//! element: an element is addressed by its merge key (`[name="web"]`,
//! `[port=80]`) when every element carries a distinct one, by position (`[0]`)
//! otherwise. Scalars, empty objects, empty lists and lists of scalars are leaves.
//! A path segment addresses a list element only when the value it is applied to
//! is a list; inside objects every segment is a plain key.

use std::collections::BTreeSet;

use serde_json::Map;

use crate::keys;
use crate::Json;

pub type FieldPath = Vec<String>;

/// Server-populated or identity metadata that never counts as declared.
const IGNORED_METADATA: [&str; 9] = [
    "name",
    "namespace",
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "managedFields",
    "selfLink",
];

/// Element fields tried, in order, as the identity of list elements.
const MERGE_KEYS: [&str; 6] = ["name", "containerPort", "port", "key", "mountPath", "ip"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    paths: BTreeSet<FieldPath>,
}

impl FieldSet {
    /// Collect the declared leaf paths of a manifest.
    pub fn from_payload(payload: &Json) -> Self {
        let mut paths = BTreeSet::new();
        if let Some(top) = payload.as_object() {
            for (k, v) in top {
                if matches!(k.as_str(), "apiVersion" | "kind" | "status") {
                    continue;
                }
                let mut prefix = vec![k.clone()];
                walk(v, &mut prefix, &mut paths);
            }
        }
        paths.retain(|p| !ignored(p));
        Self { paths }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn contains(&self, path: &[String]) -> bool {
        self.paths.iter().any(|p| p.as_slice() == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    /// Paths present in `self` but not in `other`, i.e. fields withdrawn since `self` was declared.
    pub fn withdrawn<'a>(&'a self, other: &'a FieldSet) -> impl Iterator<Item = &'a FieldPath> + 'a {
        self.paths.difference(&other.paths)
    }

    /// Compact, deterministic annotation form: a JSON array of path arrays.
    pub fn to_annotation(&self) -> String {
        let list: Vec<&FieldPath> = self.paths.iter().collect();
        serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_annotation(s: &str) -> Option<Self> {
        let list: Vec<FieldPath> = serde_json::from_str(s).ok()?;
        Some(Self { paths: list.into_iter().collect() })
    }
}

impl FromIterator<FieldPath> for FieldSet {
    fn from_iter<I: IntoIterator<Item = FieldPath>>(iter: I) -> Self {
        Self { paths: iter.into_iter().collect() }
    }
}

fn walk(v: &Json, prefix: &mut FieldPath, out: &mut BTreeSet<FieldPath>) {
    match v {
        Json::Object(map) if !map.is_empty() => {
            for (k, child) in map {
                prefix.push(k.clone());
                walk(child, prefix, out);
                prefix.pop();
            }
        }
        Json::Array(items) if !items.is_empty() && items.iter().all(Json::is_object) => {
            let key = merge_key(items);
            for (i, item) in items.iter().enumerate() {
                let seg = match key.and_then(|k| Some((k, item.get(k)?))) {
                    Some((k, value)) => keyed_segment(k, value),
                    None => index_segment(i),
                };
                prefix.push(seg);
                walk(item, prefix, out);
                prefix.pop();
            }
        }
        _ => {
            out.insert(prefix.clone());
        }
    }
}

/// First merge key every element carries as a scalar, with no two elements sharing a value.
fn merge_key(items: &[Json]) -> Option<&'static str> {
    MERGE_KEYS.into_iter().find(|k| {
        let mut seen = BTreeSet::new();
        items.iter().all(|item| match item.get(*k) {
            Some(v @ (Json::String(_) | Json::Number(_))) => seen.insert(v.to_string()),
            _ => false,
        })
    })
}

fn keyed_segment(key: &str, value: &Json) -> String {
    format!("[{}={}]", key, value)
}

fn index_segment(i: usize) -> String {
    format!("[{}]", i)
}

enum Segment<'a> {
    Field,
    Index(usize),
    Keyed(&'a str, Json),
}

fn parse_segment(seg: &str) -> Segment<'_> {
    let Some(inner) = seg.strip_prefix('[').and_then(|r| r.strip_suffix(']')) else { return Segment::Field };
    match inner.split_once('=') {
        Some((k, v)) => match serde_json::from_str(v) {
            Ok(value) => Segment::Keyed(k, value),
            Err(_) => Segment::Field,
        },
        None => inner.parse().map_or(Segment::Field, Segment::Index),
    }
}

/// Whether `seg` addresses a list element.
pub fn is_element_segment(seg: &str) -> bool {
    !matches!(parse_segment(seg), Segment::Field)
}

/// Position addressed by a `[i]` segment.
pub fn segment_index(seg: &str) -> Option<usize> {
    match parse_segment(seg) {
        Segment::Index(i) => Some(i),
        _ => None,
    }
}

fn element_position(items: &[Json], seg: &str) -> Option<usize> {
    match parse_segment(seg) {
        Segment::Field => None,
        Segment::Index(i) => (i < items.len()).then_some(i),
        Segment::Keyed(k, want) => items.iter().position(|e| e.get(k) == Some(&want)),
    }
}

fn ignored(p: &[String]) -> bool {
    match p {
        [m, field, ..] if m == "metadata" && IGNORED_METADATA.contains(&field.as_str()) => true,
        [m, a, key] if m == "metadata" && a == "annotations" => keys::STAMP_ANNOTATIONS.contains(&key.as_str()),
        [m, l, key] if m == "metadata" && l == "labels" => key == keys::MANAGED_LABEL,
        _ => false,
    }
}

pub fn get_path<'a>(v: &'a Json, path: &[String]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, seg| match cur {
        Json::Object(map) => map.get(seg.as_str()),
        Json::Array(items) => items.get(element_position(items, seg)?),
        _ => None,
    })
}

/// Set `value` at `path`, creating (or replacing mistyped) intermediate nodes. A
/// missing keyed element is appended carrying its key.
pub fn set_path(v: &mut Json, path: &[String], value: Json) {
    let mut cur = v;
    for seg in path {
        cur = child_mut(cur, seg);
    }
    *cur = value;
}

fn child_mut<'a>(v: &'a mut Json, seg: &str) -> &'a mut Json {
    let parsed = parse_segment(seg);
    if !v.is_object() {
        match parsed {
            Segment::Field => *v = Json::Object(Map::new()),
            _ if !v.is_array() => *v = Json::Array(Vec::new()),
            _ => {}
        }
    }
    match v {
        Json::Object(map) => map.entry(seg.to_string()).or_insert(Json::Null),
        Json::Array(items) => {
            let pos = match element_position(items, seg) {
                Some(pos) => pos,
                None => push_element(items, parsed),
            };
            &mut items[pos]
        }
        other => other,
    }
}

fn push_element(items: &mut Vec<Json>, seg: Segment<'_>) -> usize {
    match seg {
        Segment::Index(i) => {
            if items.len() <= i {
                items.resize(i + 1, Json::Null);
            }
            i
        }
        Segment::Keyed(k, value) => {
            let mut element = Map::new();
            element.insert(k.to_string(), value);
            items.push(Json::Object(element));
            items.len() - 1
        }
        Segment::Field => {
            items.push(Json::Null);
            items.len() - 1
        }
    }
}

/// Remove the node at `path` (a field or a whole list element); returns it if it existed.
pub fn remove_path(v: &mut Json, path: &[String]) -> Option<Json> {
    let (last, parents) = path.split_last()?;
    let mut cur = v;
    for seg in parents {
        cur = match cur {
            Json::Object(map) => map.get_mut(seg.as_str())?,
            Json::Array(items) => {
                let pos = element_position(items, seg)?;
                items.get_mut(pos)?
            }
            _ => return None,
        };
    }
    match cur {
        Json::Object(map) => map.remove(last.as_str()),
        Json::Array(items) => {
            let pos = element_position(items, last)?;
            Some(items.remove(pos))
        }
        _ => None,
    }
}
