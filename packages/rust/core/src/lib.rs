//! Pipeline files, crawl templates and end-to-end crawl workflows for Harvester.
//!
//! This crate ties together the pipeline engine, the crawler nodes and the
//! annex into the operations the CLI exposes (`run`, `init`, `crawl`).

pub mod crawl;
pub mod pipeline_file;
pub mod templates;

pub use crawl::{
    CrawlSummary, ProgressReporter, SilentProgress, crawl_dataset, crawl_with_annex,
    init_dataset, run_pipeline_file,
};
pub use pipeline_file::{
    AnnexSpec, BuildEnv, BuiltPipeline, ElementSpec, FollowSpec, NodeSpec, PipelineFile,
};
pub use templates::{TEMPLATES, Template, TemplateArgs};
