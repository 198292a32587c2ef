//! Versioned dataset storage for crawled resources.
//!
//! This crate provides:
//! - [`VersionStore`]: the commit/branch interface, with [`GitStore`] and
//!   [`MemoryStore`] backends
//! - [`AnnexKey`]: content-addressed keys and pointer blobs
//! - [`LargeFiles`]: the predicate choosing annex vs plain git storage
//! - [`Annexator`]: the pipeline node staging downloads, plus its
//!   [`Finalize`] node committing them across the branch roles
//! - [`archives`]: `.tar.gz` extraction for the processed branch

pub mod annexator;
pub mod archives;
pub mod git;
pub mod key;
pub mod largefiles;
pub mod memory;
pub mod store;

pub use annexator::{
    ANNEX_BRANCH, AnnexOptions, Annexator, CRAWL_CONFIG_PATH, DatasetInit, Finalize, Finalized,
};
pub use git::GitStore;
pub use key::AnnexKey;
pub use largefiles::{Glob, LargeFiles, parse_size};
pub use memory::MemoryStore;
pub use store::{ObjectId, Tree, VersionStore, apply_diff, branch_tree};
