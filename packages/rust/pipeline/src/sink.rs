//! Terminal record collectors.

use std::sync::{Arc, Mutex, MutexGuard};

use harvester_shared::Record;
use serde_json::Value;

/// Collects every record that reaches it, in arrival order.
#[derive(Debug)]
pub struct Sink {
    name: String,
    records: Mutex<Vec<Record>>,
}

impl Sink {
    /// Create a named sink, ready to be placed in one or more pipelines.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record to the history.
    pub fn absorb(&self, record: Record) {
        self.lock().push(record);
    }

    /// Copy of everything absorbed so far.
    pub fn records(&self) -> Vec<Record> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Values of `fields` for every record that has all of them.
    ///
    /// Records missing any requested field are skipped.
    pub fn project(&self, fields: &[&str]) -> Vec<Vec<Value>> {
        self.lock()
            .iter()
            .filter_map(|r| r.project(fields))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Record>> {
        // A panic while pushing cannot leave the Vec half-written.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
