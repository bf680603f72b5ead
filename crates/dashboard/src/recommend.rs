use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    #[serde(default)]
    recommendation: Option<String>,
}

/// Fetches free-text advice from the recommendation endpoint. One request per
/// call, no retries.
#[derive(Clone)]
pub struct RecommendationClient {
    http: reqwest::Client,
    url: String,
}

impl RecommendationClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// `Ok(None)` when the endpoint answered but had nothing to say.
    pub async fn fetch(&self) -> Result<Option<String>> {
        let body: RecommendationResponse = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("recommendation request failed: {}", self.url))?
            .error_for_status()
            .context("recommendation endpoint returned an error")?
            .json()
            .await
            .context("invalid recommendation response")?;

        Ok(body.recommendation.filter(|r| !r.trim().is_empty()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
