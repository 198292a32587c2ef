//! Shared types, error model, and configuration for Harvester.
//!
//! This crate is the foundation depended on by all other Harvester crates.
//! It provides:
//! - [`HarvesterError`]: the unified error type
//! - [`Record`]: the unit of data flowing through pipelines
//! - [`ActivityStats`]: counters shared across a pipeline run
//! - Configuration ([`AppConfig`], [`FetchConfig`], [`AnnexConfig`], config loading)

pub mod config;
pub mod error;
pub mod stats;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnnexConfig, AnnexSection, AppConfig, FetchConfig, HttpConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{HarvesterError, Result};
pub use stats::{ActivityStats, Counter, StatsSnapshot};
pub use types::{Record, fields};
