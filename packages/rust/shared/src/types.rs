//! Core domain types for Harvester pipelines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known record field names shared by nodes.
pub mod fields {
    /// Absolute URL the record refers to.
    pub const URL: &str = "url";
    /// Visible text of the link the record was matched from.
    pub const URL_TEXT: &str = "url_text";
    /// Raw `href` attribute before resolution.
    pub const URL_HREF: &str = "url_href";
    /// Fetched document body (or the matched fragment of it).
    pub const RESPONSE: &str = "response";
    /// Target file name inside the repository.
    pub const FILENAME: &str = "filename";
    /// Relative directory the file goes into.
    pub const PATH: &str = "path";
    /// Final repository path of a materialized file.
    pub const FILEPATH: &str = "filepath";
    /// Content-addressed key of an annexed file.
    pub const ANNEX_KEY: &str = "annex_key";
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One unit of structured data flowing through a pipeline.
///
/// Records are treated as immutable snapshots: nodes read a `&Record` and
/// emit new records built with [`Record::with`] / [`Record::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    /// An empty record (the seed of every run).
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Get a field as a string slice, if it is a JSON string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Whether the record carries `field`.
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Set a field in place, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Remove a field in place.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// A copy of this record with `field` set to `value`.
    pub fn with(&self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut out = self.clone();
        out.insert(field, value);
        out
    }

    /// A copy of this record with `other`'s fields merged in.
    ///
    /// Existing fields are kept unless `overwrite` is set.
    pub fn merged<'a, I>(&self, other: I, overwrite: bool) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut out = self.clone();
        for (k, v) in other {
            if overwrite || !out.0.contains_key(k) {
                out.0.insert(k.clone(), v.clone());
            }
        }
        out
    }

    /// Iterate over `(field, value)` pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field values for `names`, in order, or `None` if any is missing.
    pub fn project(&self, names: &[&str]) -> Option<Vec<Value>> {
        names.iter().map(|n| self.0.get(*n).cloned()).collect()
    }

    /// Fill `{field}` placeholders in `template` from string/number fields.
    ///
    /// Unknown placeholders are left untouched.
    pub fn interpolate(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.0.get(name) {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(v @ (Value::Number(_) | Value::Bool(_))) => {
                            out.push_str(&v.to_string())
                        }
                        _ => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
