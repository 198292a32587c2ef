//! Generic, I/O-free nodes: field assignment, ranges, interrupts, filters.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use harvester_shared::{HarvesterError, Record, Result, fields};
use regex::Regex;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::node::{Node, NodeOutput, RunContext};

// ---------------------------------------------------------------------------
// Assign
// ---------------------------------------------------------------------------

/// Merges a fixed set of fields into every passing record.
pub struct Assign {
    fields: Record,
    overwrite: bool,
    interpolate: bool,
}

impl Assign {
    /// Existing fields are preserved unless [`Assign::overwrite`] is set.
    pub fn new(fields: Record) -> Self {
        Self {
            fields,
            overwrite: false,
            interpolate: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Fill `{field}` placeholders in string values from the incoming record.
    pub fn interpolate(mut self, interpolate: bool) -> Self {
        self.interpolate = interpolate;
        self
    }
}

#[async_trait]
impl Node for Assign {
    fn name(&self) -> &str {
        "assign"
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        if !self.interpolate {
            return Ok(NodeOutput::one(record.merged(&self.fields, self.overwrite)));
        }
        let filled: Record = self
            .fields
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k.clone(), Value::String(record.interpolate(s))),
                other => (k.clone(), other.clone()),
            })
            .collect();
        Ok(NodeOutput::one(record.merged(&filled, self.overwrite)))
    }
}

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

/// Passes only records whose arrival index lies in `[start, stop)`.
pub struct Range {
    start: usize,
    stop: Option<usize>,
    seen: AtomicUsize,
}

impl Range {
    pub fn new(start: usize, stop: Option<usize>) -> Self {
        Self {
            start,
            stop,
            seen: AtomicUsize::new(0),
        }
    }

    /// The first `n` records.
    pub fn first(n: usize) -> Self {
        Self::new(0, Some(n))
    }
}

#[async_trait]
impl Node for Range {
    fn name(&self) -> &str {
        "range"
    }

    fn reset(&self) {
        self.seen.store(0, Ordering::SeqCst);
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        let index = self.seen.fetch_add(1, Ordering::SeqCst);
        let in_range = index >= self.start && self.stop.is_none_or(|stop| index < stop);
        if in_range {
            Ok(NodeOutput::one(record.clone()))
        } else {
            Ok(NodeOutput::none())
        }
    }
}

// ---------------------------------------------------------------------------
// InterruptIf
// ---------------------------------------------------------------------------

enum Condition {
    After(usize),
    Matches(Record),
}

/// Finishes the pipeline after N records, or when a record matches given values.
pub struct InterruptIf {
    condition: Condition,
    seen: AtomicUsize,
}

impl InterruptIf {
    /// Let `n` records pass, finish on the next one.
    pub fn after(n: usize) -> Self {
        Self {
            condition: Condition::After(n),
            seen: AtomicUsize::new(0),
        }
    }

    /// Finish when a record carries all of `values`.
    pub fn matches(values: Record) -> Self {
        Self {
            condition: Condition::Matches(values),
            seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Node for InterruptIf {
    fn name(&self) -> &str {
        "interrupt_if"
    }

    fn reset(&self) {
        self.seen.store(0, Ordering::SeqCst);
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        let interrupt = match &self.condition {
            Condition::After(n) => self.seen.fetch_add(1, Ordering::SeqCst) >= *n,
            Condition::Matches(values) => values.iter().all(|(k, v)| record.get(k) == Some(v)),
        };
        if interrupt {
            debug!("interrupt condition met");
            Ok(NodeOutput::Finish)
        } else {
            Ok(NodeOutput::one(record.clone()))
        }
    }
}

// ---------------------------------------------------------------------------
// FieldMatches
// ---------------------------------------------------------------------------

/// Keeps records whose `field` matches a regex; named groups are merged in.
pub struct FieldMatches {
    field: String,
    pattern: Regex,
}

impl FieldMatches {
    pub fn new(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| HarvesterError::parse(format!("invalid pattern {pattern:?}: {e}")))?;
        Ok(Self {
            field: field.into(),
            pattern,
        })
    }
}

#[async_trait]
impl Node for FieldMatches {
    fn name(&self) -> &str {
        "field_matches"
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        let Some(value) = record.get_str(&self.field) else {
            return Ok(NodeOutput::none());
        };
        let Some(caps) = self.pattern.captures(value) else {
            return Ok(NodeOutput::none());
        };
        let mut out = record.clone();
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                out.insert(name, m.as_str());
            }
        }
        Ok(NodeOutput::one(out))
    }
}

// ---------------------------------------------------------------------------
// UrlFilename
// ---------------------------------------------------------------------------

/// Sets `filename` from the last path segment of `url`, unless already set.
pub struct UrlFilename;

/// The last non-empty path segment of `url`, if any.
pub fn url_filename(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(String::from)
}

#[async_trait]
impl Node for UrlFilename {
    fn name(&self) -> &str {
        "url_filename"
    }

    async fn call(&self, record: &Record, _ctx: &RunContext) -> Result<NodeOutput> {
        if record.contains(fields::FILENAME) {
            return Ok(NodeOutput::one(record.clone()));
        }
        let name = record.get_str(fields::URL).and_then(url_filename);
        match name {
            Some(name) => Ok(NodeOutput::one(record.with(fields::FILENAME, name))),
            None => Ok(NodeOutput::one(record.clone())),
        }
    }
}
