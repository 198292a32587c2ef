//! Application configuration for Harvester.
//!
//! User config lives at `~/.harvester/harvester.toml`.
//! Settings missing from the file fall back to their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarvesterError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "harvester.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".harvester";

// ---------------------------------------------------------------------------
// Config structs (matching harvester.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Annex/repository settings.
    #[serde(default)]
    pub annex: AnnexSection,
}

/// `[http]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum redirects followed per request.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Minimum ms to wait before each request.
    #[serde(default)]
    pub rate_limit_ms: u64,

    /// Allow fetching from loopback/private addresses.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_redirects: default_max_redirects(),
            rate_limit_ms: 0,
            allow_private_hosts: false,
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    5
}

/// `[annex]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnexSection {
    /// Largefiles expression used when a pipeline does not set its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largefiles: Option<String>,

    /// Branch receiving raw crawled content.
    #[serde(default = "default_incoming")]
    pub incoming_branch: String,

    /// Branch receiving processed history.
    #[serde(default = "default_processed")]
    pub processed_branch: String,

    /// User-facing branch.
    #[serde(default = "default_master")]
    pub master_branch: String,
}

impl Default for AnnexSection {
    fn default() -> Self {
        Self {
            largefiles: None,
            incoming_branch: default_incoming(),
            processed_branch: default_processed(),
            master_branch: default_master(),
        }
    }
}

fn default_incoming() -> String {
    "incoming".into()
}
fn default_processed() -> String {
    "incoming-processed".into()
}
fn default_master() -> String {
    "master".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags / pipeline files)
// ---------------------------------------------------------------------------

/// Runtime HTTP fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum redirects followed per request.
    pub max_redirects: usize,
    /// Delay in ms before each request.
    pub rate_limit_ms: u64,
    /// Allow loopback/private hosts (mock servers, intranet mirrors).
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout_secs: config.http.timeout_secs,
            max_redirects: config.http.max_redirects,
            rate_limit_ms: config.http.rate_limit_ms,
            allow_private_hosts: config.http.allow_private_hosts,
        }
    }
}

/// Runtime annex configuration: branch roles and the largefiles expression.
#[derive(Debug, Clone)]
pub struct AnnexConfig {
    pub largefiles: Option<String>,
    pub incoming_branch: String,
    pub processed_branch: String,
    pub master_branch: String,
}

impl Default for AnnexConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for AnnexConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            largefiles: config.annex.largefiles.clone(),
            incoming_branch: config.annex.incoming_branch.clone(),
            processed_branch: config.annex.processed_branch.clone(),
            master_branch: config.annex.master_branch.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.harvester/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarvesterError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.harvester/harvester.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvesterError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HarvesterError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvesterError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvesterError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvesterError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("timeout_secs"));
        assert!(toml_str.contains("incoming-processed"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.http.timeout_secs, 30);
        assert_eq!(parsed.annex.master_branch, "master");
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[http]
allow_private_hosts = true

[annex]
largefiles = "exclude=*.txt"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!(config.http.allow_private_hosts);
        assert_eq!(config.http.max_redirects, 5);
        assert_eq!(config.annex.largefiles.as_deref(), Some("exclude=*.txt"));
        assert_eq!(config.annex.incoming_branch, "incoming");
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let fetch = FetchConfig::from(&app);
        assert_eq!(fetch.timeout_secs, 30);
        assert!(!fetch.allow_private_hosts);

        let annex = AnnexConfig::from(&app);
        assert_eq!(annex.processed_branch, "incoming-processed");
        assert!(annex.largefiles.is_none());
    }

    #[test]
    fn load_config_from_reports_parse_errors() {
        let dir = std::env::temp_dir().join(format!("hv-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("bad.toml");
        std::fs::write(&path, "[http\ntimeout_secs = ").expect("write");

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
