//! HTTP fetching shared by crawl and annex nodes.
//!
//! Applies redirect/timeout/rate limits, blocks private targets unless
//! configured otherwise, and turns non-success statuses into errors.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::{Client, Response};
use tracing::{debug, warn};
use url::Url;

use harvester_shared::{FetchConfig, HarvesterError, Result};

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("Harvester/", env!("CARGO_PKG_VERSION"));

/// A fetched text document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// URL after redirects.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// HTTP client wrapper used by every network-facing node.
#[derive(Debug, Clone)]
pub struct Fetcher {
    config: FetchConfig,
    client: Client,
}

impl Fetcher {
    /// Create a fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HarvesterError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `url` as text.
    pub async fn fetch_text(&self, url: &Url) -> Result<FetchedDocument> {
        let response = self.get(url).await?;
        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HarvesterError::Network(format!("{url}: body read failed: {e}")))?;

        debug!(%url, status, bytes = body.len(), "fetched document");
        Ok(FetchedDocument {
            url: final_url,
            status,
            body,
        })
    }

    /// Fetch `url` as raw bytes.
    pub async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HarvesterError::Network(format!("{url}: body read failed: {e}")))?;

        debug!(%url, bytes = bytes.len(), "downloaded resource");
        Ok(bytes.to_vec())
    }

    async fn get(&self, url: &Url) -> Result<Response> {
        if !self.config.allow_private_hosts && is_ssrf_target(url) {
            warn!(%url, "SSRF protection: blocked");
            return Err(HarvesterError::validation(format!(
                "{url}: refusing to fetch a private or non-HTTP target"
            )));
        }

        if self.config.rate_limit_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.rate_limit_ms)).await;
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| HarvesterError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarvesterError::Network(format!("{url}: HTTP {status}")));
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Parse a URL field value, with a validation error naming the input.
pub fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| HarvesterError::validation(format!("invalid URL {raw:?}: {e}")))
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Remove trailing slash for consistency (except root path)
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

/// Resolve an `href` against the document URL, skipping anchors and pseudo-links.
pub fn resolve_href(base: Option<&Url>, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
    {
        return None;
    }

    let mut resolved = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    resolved.set_fragment(None);
    Some(resolved)
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
