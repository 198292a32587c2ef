//! Pipeline interpreter.

use std::sync::Arc;

use futures::future::BoxFuture;
use harvester_shared::{ActivityStats, Record, Result, StatsSnapshot};
use tracing::{Instrument, Span, debug, info, info_span};

use crate::node::{NodeOutput, RunContext};
use crate::pipeline::{Element, Pipeline};

/// Whether interpretation may go on after a subtree returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

/// Outcome of a completed (or early-terminated) run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Records that reached the end of the top-level sequence.
    pub records: Vec<Record>,
    /// A node asked to finish before the input was exhausted.
    pub finished_early: bool,
    /// Counters at the end of the run.
    pub stats: StatsSnapshot,
}

/// Drives a [`Pipeline`] to completion.
pub struct Runner {
    ctx: RunContext,
    span: Option<Span>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Arc::new(ActivityStats::new()))
    }
}

impl Runner {
    /// A runner whose nodes share `stats`.
    pub fn new(stats: Arc<ActivityStats>) -> Self {
        Self {
            ctx: RunContext::new(stats),
            span: None,
        }
    }

    /// Log everything under `span` instead of a span derived from the pipeline name.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// The stats shared with nodes.
    pub fn stats(&self) -> &Arc<ActivityStats> {
        &self.ctx.stats
    }

    /// Run from an empty seed record.
    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunReport> {
        self.run_with_seed(pipeline, Record::new()).await
    }

    /// Run with `seed` as the first record.
    ///
    /// Node errors propagate unchanged; a [`NodeOutput::Finish`] anywhere in
    /// the tree stops the run and returns what was collected so far. Nodes are
    /// reset before the run and get [`Node::on_run_end`](crate::Node::on_run_end) after it, so the same
    /// pipeline can be run again.
    pub async fn run_with_seed(&self, pipeline: &Pipeline, seed: Record) -> Result<RunReport> {
        let span = self.span.clone().unwrap_or_else(|| {
            info_span!("pipeline", name = pipeline.name().unwrap_or("unnamed"))
        });

        async {
            debug!(tree = %pipeline.describe(), "running pipeline");

            let nodes = pipeline.nodes();
            for node in &nodes {
                node.reset();
            }

            let mut records = Vec::new();
            let flow = self
                .drive(pipeline.elements(), seed, &mut records)
                .await?;
            let finished_early = flow == Flow::Finished;

            for node in &nodes {
                node.on_run_end(&self.ctx).await?;
            }
            let stats = self.ctx.stats.snapshot();

            info!(
                records = records.len(),
                finished_early,
                %stats,
                "pipeline complete"
            );

            Ok(RunReport {
                records,
                finished_early,
                stats,
            })
        }
        .instrument(span)
        .await
    }

    /// Feed `record` through `elements`, collecting whatever reaches the end.
    fn drive<'a>(
        &'a self,
        elements: &'a [Element],
        record: Record,
        out: &'a mut Vec<Record>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            for (i, element) in elements.iter().enumerate() {
                match element {
                    Element::Node(node) => {
                        let emitted = match node.call(&record, &self.ctx).await? {
                            NodeOutput::Finish => {
                                info!(node = node.name(), "node requested pipeline finish");
                                return Ok(Flow::Finished);
                            }
                            NodeOutput::Emit(records) => records,
                        };
                        let rest = &elements[i + 1..];
                        for next in emitted {
                            if self.drive(rest, next, &mut *out).await? == Flow::Finished {
                                return Ok(Flow::Finished);
                            }
                        }
                        return Ok(Flow::Continue);
                    }
                    Element::Branch(branch) => {
                        // Sub-pipeline output does not feed back into this stream.
                        let mut discarded = Vec::new();
                        let flow = self
                            .drive(branch.elements(), record.clone(), &mut discarded)
                            .await?;
                        if flow == Flow::Finished {
                            return Ok(Flow::Finished);
                        }
                    }
                    Element::Sink(sink) => sink.absorb(record.clone()),
                }
            }
            out.push(record);
            Ok(Flow::Continue)
        })
    }
}

/// Run `pipeline` with fresh stats and return the records it produced.
pub async fn run_pipeline(pipeline: &Pipeline) -> Result<Vec<Record>> {
    Ok(Runner::default().run(pipeline).await?.records)
}
