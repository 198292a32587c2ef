//! Web-facing pipeline nodes for Harvester.
//!
//! This crate provides:
//! - [`Fetcher`]: the rate-limited, SSRF-guarded HTTP client
//! - [`CrawlUrl`]: the source node fetching pages (optionally following links)
//! - [`AHrefMatch`] / [`CssMatch`]: extraction nodes over fetched documents
//! - [`TokenGenerator`]: token login for authenticated data portals

pub mod auth;
pub mod client;
pub mod crawl_url;
pub mod matches;

pub use auth::TokenGenerator;
pub use client::{FetchedDocument, Fetcher, normalize_url, parse_url, resolve_href};
pub use crawl_url::CrawlUrl;
pub use matches::{AHrefMatch, CssMatch, Extract};
