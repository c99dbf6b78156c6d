//! Field-level diffs between two object states.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::resource::Body;

/// Dotted path to a field, e.g. `spec.replicas`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FieldPath(SmallVec<[String; 4]>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path. Empty segments are skipped.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_owned());
        Self(segments)
    }

    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Path relative to `prefix`, if `self` lies under it.
    pub fn strip_prefix(&self, prefix: &FieldPath) -> Option<FieldPath> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| Self(rest.iter().cloned().collect()))
    }

    /// Whether a change at `self` affects `other` or vice versa.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// The value at this path, if present and not null.
    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let found = self
            .0
            .iter()
            .try_fold(value, |current, key| current.as_object()?.get(key))?;
        (!found.is_null()).then_some(found)
    }

    /// Remove the value at this path. Returns whether anything was removed.
    pub fn remove(&self, value: &mut Value) -> bool {
        let Some((last, parents)) = self.0.split_last() else {
            return false;
        };
        let mut current = value;
        for key in parents {
            match current.as_object_mut().and_then(|m| m.get_mut(key)) {
                Some(next) => current = next,
                None => return false,
            }
        }
        current
            .as_object_mut()
            .is_some_and(|m| m.remove(last).is_some())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::parse(&path)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

/// Kind of a single field change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Add,
    Change,
    Remove,
}

/// One field-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffItem {
    pub op: DiffOp,
    pub path: FieldPath,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Ordered sequence of field changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff(Vec<DiffItem>);

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffItem> {
        self.0.iter()
    }

    /// Whether any change touches `field` (below, at or above it).
    pub fn touches(&self, field: &FieldPath) -> bool {
        self.0.iter().any(|item| item.path.overlaps(field))
    }

    /// The diff as seen from inside `field`.
    ///
    /// Changes below the field are re-rooted at it; changes at or above the
    /// field are narrowed to the field's own old and new values.
    pub fn reduce(&self, field: &FieldPath) -> Diff {
        let mut out = Vec::new();
        for item in &self.0 {
            if let Some(rest) = item.path.strip_prefix(field) {
                out.push(DiffItem {
                    op: item.op,
                    path: rest,
                    old: item.old.clone(),
                    new: item.new.clone(),
                });
            } else if let Some(tail) = field.strip_prefix(&item.path) {
                let old = item.old.as_ref().and_then(|v| tail.resolve(v));
                let new = item.new.as_ref().and_then(|v| tail.resolve(v));
                diff_into(old, new, &FieldPath::root(), &mut out);
            }
        }
        Diff(out)
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = &'a DiffItem;
    type IntoIter = std::slice::Iter<'a, DiffItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<DiffItem> for Diff {
    fn from_iter<T: IntoIterator<Item = DiffItem>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Compute the changes from `old` to `new`. Nulls count as absent.
pub fn diff(old: Option<&Value>, new: Option<&Value>) -> Diff {
    let mut out = Vec::new();
    diff_into(old, new, &FieldPath::root(), &mut out);
    Diff(out)
}

fn diff_into(old: Option<&Value>, new: Option<&Value>, path: &FieldPath, out: &mut Vec<DiffItem>) {
    let old = old.filter(|v| !v.is_null());
    let new = new.filter(|v| !v.is_null());
    match (old, new) {
        (None, None) => {}
        (Some(a), Some(b)) if a == b => {}
        (None, Some(b)) => out.push(DiffItem {
            op: DiffOp::Add,
            path: path.clone(),
            old: None,
            new: Some(b.clone()),
        }),
        (Some(a), None) => out.push(DiffItem {
            op: DiffOp::Remove,
            path: path.clone(),
            old: Some(a.clone()),
            new: None,
        }),
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            for (key, value) in b.iter().filter(|(k, _)| !a.contains_key(*k)) {
                diff_into(None, Some(value), &path.child(key), out);
            }
            for (key, value) in a.iter().filter(|(k, _)| !b.contains_key(*k)) {
                diff_into(Some(value), None, &path.child(key), out);
            }
            for (key, value) in a.iter() {
                if let Some(other) = b.get(key) {
                    diff_into(Some(value), Some(other), &path.child(key), out);
                }
            }
        }
        (Some(a), Some(b)) => out.push(DiffItem {
            op: DiffOp::Change,
            path: path.clone(),
            old: Some(a.clone()),
            new: Some(b.clone()),
        }),
    }
}

/// Metadata fields that survive into the essence.
const KEPT_METADATA: &[&str] = &["labels", "annotations"];

/// Annotations that never count as changes.
const VOLATILE_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];

/// The part of a body that matters for change detection.
///
/// Drops `status`, all metadata except labels and annotations, annotations
/// under `own_prefix` (the reactor's own bookkeeping) and `ignored` fields.
pub fn essence(body: &Body, own_prefix: &str, ignored: &[FieldPath]) -> Value {
    let Value::Object(source) = body else {
        return Value::Null;
    };
    let mut result: Map<String, Value> = source
        .iter()
        .filter(|(key, _)| key.as_str() != "metadata" && key.as_str() != "status")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(Value::Object(metadata)) = source.get("metadata") {
        let mut kept = Map::new();
        for key in KEPT_METADATA {
            let Some(Value::Object(entries)) = metadata.get(*key) else {
                continue;
            };
            let entries: Map<String, Value> = entries
                .iter()
                .filter(|(k, _)| {
                    *key != "annotations"
                        || (!k.starts_with(&format!("{own_prefix}/"))
                            && !VOLATILE_ANNOTATIONS.contains(&k.as_str()))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !entries.is_empty() {
                kept.insert((*key).to_owned(), Value::Object(entries));
            }
        }
        if !kept.is_empty() {
            result.insert("metadata".to_owned(), Value::Object(kept));
        }
    }

    let mut essence = Value::Object(result);
    for field in ignored {
        field.remove(&mut essence);
    }
    essence
}
