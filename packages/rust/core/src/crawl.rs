//! End-to-end workflows: run a pipeline file, initialize a dataset from a
//! template, and re-crawl a dataset from what it recorded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, info_span, instrument};

use harvester_annex::{AnnexOptions, Annexator, DatasetInit};
use harvester_crawler::Fetcher;
use harvester_pipeline::Runner;
use harvester_shared::{
    ActivityStats, AnnexConfig, AppConfig, FetchConfig, HarvesterError, Record, Result,
    StatsSnapshot,
};

use crate::pipeline_file::{BuildEnv, BuiltPipeline, PipelineFile};
use crate::templates::{self, TemplateArgs};

/// Outcome of a crawl.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    /// Records that reached the end of the top-level pipeline.
    pub records: Vec<Record>,
    /// Contents of every named sink.
    pub sinks: BTreeMap<String, Vec<Record>>,
    pub stats: StatsSnapshot,
    /// An `interrupt_if` (or similar) cut the run short.
    pub finished_early: bool,
    pub elapsed: Duration,
}

/// Progress callback for reporting crawl status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when the crawl completes.
    fn done(&self, summary: &CrawlSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn done(&self, _summary: &CrawlSummary) {}
}

fn fetcher(config: &AppConfig) -> Result<Arc<Fetcher>> {
    Ok(Arc::new(Fetcher::new(FetchConfig::from(config))?))
}

/// Load, build and run the pipeline file at `path`.
///
/// A relative `[annex] path` is resolved against the file's directory.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn run_pipeline_file(
    path: &Path,
    config: &AppConfig,
    progress: &dyn ProgressReporter,
) -> Result<CrawlSummary> {
    progress.phase("Loading pipeline");
    let file = PipelineFile::load(path)?;

    let mut env = BuildEnv::new(fetcher(config)?);
    env.annex_config = AnnexConfig::from(config);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        env.base_dir = dir.to_path_buf();
    }
    let built = file.build(&env)?;

    let name = file.name.as_deref().unwrap_or("unnamed");
    let span = info_span!("pipeline", name);
    execute(built, span, progress).await
}

/// Create (or reopen) the dataset at `path` and record `template` with
/// `args` as its crawl configuration.
///
/// The template's default largefiles expression applies unless the config
/// sets one.
#[instrument(skip(args, config), fields(path = %path.display()))]
pub fn init_dataset(
    path: &Path,
    template: &str,
    args: TemplateArgs,
    config: &AppConfig,
) -> Result<DatasetInit> {
    let tpl = templates::find(template)?;
    tpl.validate(&args)?;

    let annex_config = AnnexConfig::from(config);
    let mut options = AnnexOptions::new(annex_config.clone()).create(true);
    if let (None, Some(expr)) = (&annex_config.largefiles, tpl.default_largefiles) {
        options = options.largefiles(expr);
    }
    let annex = Annexator::open(path, options, fetcher(config)?)?;

    let init = DatasetInit {
        template: tpl.name.to_string(),
        args,
    };
    annex.initiate(&init)?;
    info!(template = tpl.name, "dataset ready for crawling");
    Ok(init)
}

/// Re-run the template recorded in the dataset at `path`.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn crawl_dataset(
    path: &Path,
    config: &AppConfig,
    progress: &dyn ProgressReporter,
) -> Result<CrawlSummary> {
    progress.phase("Opening dataset");
    let fetcher = fetcher(config)?;
    let options = AnnexOptions::new(AnnexConfig::from(config));
    let annex = Arc::new(Annexator::open(path, options, Arc::clone(&fetcher))?);
    crawl_with_annex(annex, fetcher, progress).await
}

/// Run the recorded template against an already opened dataset.
pub async fn crawl_with_annex(
    annex: Arc<Annexator>,
    fetcher: Arc<Fetcher>,
    progress: &dyn ProgressReporter,
) -> Result<CrawlSummary> {
    let init = annex.dataset_init()?.ok_or_else(|| {
        HarvesterError::config("dataset has no crawl configuration; run `harvester init` first")
    })?;
    let template = templates::find(&init.template)?;

    progress.phase("Building pipeline");
    let file = template.pipeline(&init.args)?;
    let built = file.build(&BuildEnv::new(fetcher).with_annex(annex))?;

    let span = info_span!("crawl", template = template.name);
    execute(built, span, progress).await
}

async fn execute(
    built: BuiltPipeline,
    span: tracing::Span,
    progress: &dyn ProgressReporter,
) -> Result<CrawlSummary> {
    let start = Instant::now();
    progress.phase("Crawling");

    let runner = Runner::new(Arc::new(ActivityStats::new())).with_span(span);
    let report = runner.run(&built.pipeline).await?;

    let summary = CrawlSummary {
        records: report.records,
        sinks: built
            .sinks
            .iter()
            .map(|(name, sink)| (name.clone(), sink.records()))
            .collect(),
        stats: report.stats,
        finished_early: report.finished_early,
        elapsed: start.elapsed(),
    };
    progress.done(&summary);
    Ok(summary)
}
