//! Token login against LORIS-style JSON APIs.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use harvester_shared::{HarvesterError, Result};

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// Exchanges a username and password for an API token.
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    url: Url,
    client: Client,
}

impl TokenGenerator {
    /// `url` is the login endpoint, e.g. `https://loris.example.org/api/v0.0.2/login`.
    pub fn new(url: Url) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HarvesterError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url, client })
    }

    /// POST the credentials and return the issued token.
    ///
    /// Any non-success status is reported as [`HarvesterError::AccessDenied`],
    /// since the endpoint answers bad credentials with a bare error status.
    #[instrument(skip(self, password), fields(url = %self.url))]
    pub async fn generate_token(&self, user: &str, password: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url.as_str())
            .json(&Credentials {
                username: user,
                password,
            })
            .send()
            .await
            .map_err(|e| HarvesterError::Network(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarvesterError::AccessDenied(format!(
                "{} rejected credentials for {user:?}: HTTP {status}",
                self.url
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| HarvesterError::parse(format!("login response is not JSON: {e}")))?;
        let token = body
            .token
            .ok_or_else(|| HarvesterError::parse("login response carries no `token`"))?;

        debug!(user, "obtained token");
        Ok(token)
    }
}
