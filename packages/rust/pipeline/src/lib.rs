//! Declarative pipeline engine.
//!
//! A [`Pipeline`] is an immutable tree of [`Node`]s, nested branches and
//! [`Sink`]s. The [`Runner`] interprets it depth-first: every record a node
//! emits flows through the rest of the sequence before the next one is
//! considered. Branches get their own copy of the current record and their
//! output never flows back into the parent.
//!
//! ```ignore
//! let links = Sink::new("links");
//! let pipeline = Pipeline::builder()
//!     .node(crawl_url)
//!     .branch(Pipeline::builder().node(a_href_match).sink(&links).build())
//!     .build();
//! let records = run_pipeline(&pipeline).await?;
//! ```

pub mod node;
pub mod nodes;
pub mod pipeline;
pub mod runner;
pub mod sink;

pub use node::{Node, NodeOutput, RunContext};
pub use nodes::{Assign, FieldMatches, InterruptIf, Range, UrlFilename};
pub use pipeline::{Element, Pipeline, PipelineBuilder};
pub use runner::{RunReport, Runner, run_pipeline};
pub use sink::Sink;
