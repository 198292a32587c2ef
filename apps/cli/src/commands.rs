//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use harvester_core::{CrawlSummary, ProgressReporter, TemplateArgs, TEMPLATES};
use harvester_crawler::TokenGenerator;
use harvester_shared::{AppConfig, init_config, load_config};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Harvester: crawl the web into versioned datasets.
#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Run declarative crawl pipelines and commit what they fetch into versioned datasets.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a pipeline file and print what it produced.
    Run {
        /// Pipeline file (TOML).
        pipeline: PathBuf,
    },

    /// Create a dataset and record the template it is crawled with.
    Init {
        /// Dataset directory.
        path: PathBuf,

        /// Crawl template.
        #[arg(short, long, default_value = "openfmri")]
        template: String,

        /// Dataset identifier on the remote site.
        #[arg(long)]
        dataset: Option<String>,

        /// Base URL dataset pages live under.
        #[arg(long)]
        topurl: Option<String>,

        /// Extra template argument (KEY=VALUE, repeatable).
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },

    /// Re-crawl a dataset with the template it was initialized with.
    Crawl {
        /// Dataset directory (defaults to the current directory).
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Obtain an API token from a LORIS-style login endpoint.
    Token {
        /// Login endpoint URL.
        #[arg(long)]
        url: String,

        /// Account name.
        #[arg(long)]
        user: String,

        /// Account password.
        #[arg(long, env = "HARVESTER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// List the built-in crawl templates.
    Templates,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

const CRATES: &[&str] = &[
    "harvester",
    "harvester_shared",
    "harvester_pipeline",
    "harvester_crawler",
    "harvester_annex",
    "harvester_core",
];

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { pipeline } => cmd_run(&pipeline).await,
        Command::Init {
            path,
            template,
            dataset,
            topurl,
            args,
        } => cmd_init(&path, &template, dataset, topurl, args),
        Command::Crawl { path } => cmd_crawl(&path).await,
        Command::Token {
            url,
            user,
            password,
        } => cmd_token(&url, &user, &password).await,
        Command::Templates => cmd_templates(),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(pipeline: &Path) -> Result<()> {
    let config = load_config()?;
    info!(pipeline = %pipeline.display(), "running pipeline file");

    let reporter = CliProgress::new();
    let summary = harvester_core::run_pipeline_file(pipeline, &config, &reporter).await?;

    let output = serde_json::json!({
        "records": summary.records,
        "sinks": summary.sinks,
        "stats": summary.stats,
        "finished_early": summary.finished_early,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    print_stats(&summary);
    Ok(())
}

fn cmd_init(
    path: &Path,
    template: &str,
    dataset: Option<String>,
    topurl: Option<String>,
    extra: Vec<(String, String)>,
) -> Result<()> {
    let config = load_config()?;

    let mut args: TemplateArgs = extra.into_iter().collect();
    if let Some(dataset) = dataset {
        args.insert("dataset".into(), dataset);
    }
    if let Some(topurl) = topurl {
        args.insert("topurl".into(), topurl);
    }

    info!(path = %path.display(), template, "initializing dataset");
    let init = harvester_core::init_dataset(path, template, args, &config)?;

    println!();
    println!("  Dataset initialized!");
    println!("  Path:     {}", path.display());
    println!("  Template: {}", init.template);
    for (key, value) in &init.args {
        println!("  {key:<9} {value}");
    }
    println!();
    println!("  Run `harvester crawl {}` to fetch it.", path.display());
    println!();
    Ok(())
}

async fn cmd_crawl(path: &Path) -> Result<()> {
    let config = load_config()?;
    info!(path = %path.display(), "crawling dataset");

    let reporter = CliProgress::new();
    let summary = harvester_core::crawl_dataset(path, &config, &reporter).await?;

    println!();
    println!("  Crawl complete!");
    print_stats(&summary);
    println!();
    Ok(())
}

async fn cmd_token(url: &str, user: &str, password: &str) -> Result<()> {
    let url = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    let token = TokenGenerator::new(url)?
        .generate_token(user, password)
        .await?;
    println!("{token}");
    Ok(())
}

fn cmd_templates() -> Result<()> {
    for template in TEMPLATES {
        println!("{:<12} {}", template.name, template.description);
        println!("{:<12} requires: {}", "", template.required.join(", "));
        if let Some(largefiles) = template.default_largefiles {
            println!("{:<12} largefiles: {largefiles}", "");
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_stats(summary: &CrawlSummary) {
    let stats = &summary.stats;
    eprintln!("  URLs:        {}", stats.urls);
    eprintln!(
        "  Files:       {} (git: {}, annex: {})",
        stats.materialized, stats.add_git, stats.add_annex
    );
    eprintln!("  Overwritten: {}", stats.overwritten);
    eprintln!("  Skipped:     {}", stats.skipped);
    eprintln!("  Failed:      {}", stats.failed);
    eprintln!("  Downloaded:  {} bytes", stats.downloaded_bytes);
    if summary.finished_early {
        eprintln!("  (finished early)");
    }
    eprintln!("  Time:        {:.1}s", summary.elapsed.as_secs_f64());
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn done(&self, _summary: &CrawlSummary) {
        self.spinner.finish_and_clear();
    }
}
