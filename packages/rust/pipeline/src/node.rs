//! The node trait and the context handed to every invocation.

use std::sync::Arc;

use async_trait::async_trait;
use harvester_shared::{ActivityStats, Record, Result};

/// What a node produced for one input record.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Zero, one or many records for the rest of the pipeline.
    Emit(Vec<Record>),
    /// Stop the whole run; whatever was collected so far is returned.
    Finish,
}

impl NodeOutput {
    /// Emit exactly one record.
    pub fn one(record: Record) -> Self {
        Self::Emit(vec![record])
    }

    /// Emit nothing (filter the record out).
    pub fn none() -> Self {
        Self::Emit(Vec::new())
    }
}

/// Per-run state shared with every node.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Counters shared by the whole run.
    pub stats: Arc<ActivityStats>,
}

impl RunContext {
    pub fn new(stats: Arc<ActivityStats>) -> Self {
        Self { stats }
    }
}

/// A stream-to-stream transform, possibly with side effects.
///
/// Nodes know nothing about their neighbours: they see one record at a time
/// in the order upstream produced them. Nodes holding per-run state (counters)
/// use interior mutability since pipelines are shared immutably, and clear it
/// in [`Node::reset`].
#[async_trait]
pub trait Node: Send + Sync {
    /// Short name used in logs and [`Pipeline::describe`](crate::Pipeline::describe).
    fn name(&self) -> &str;

    /// Process one record.
    async fn call(&self, record: &Record, ctx: &RunContext) -> Result<NodeOutput>;

    /// Forget per-run state. Called on every node before a run starts.
    fn reset(&self) {}

    /// Called once after the run completed or was finished early, so nodes
    /// can flush buffered work. Skipped when the run failed.
    async fn on_run_end(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}
