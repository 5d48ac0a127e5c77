//! Provider clients - latest release/commit lookup per hosting provider
//!
//! This module provides a provider-agnostic interface for asking a code hosting API what the
//! newest release of a repository is, falling back to the newest commit when the repository
//! has never published a release.
//!
//! Every response, successful or not, is inspected for rate limit headers and reported to
//! the shared [`RateGovernor`].

pub mod github;
pub mod gitlab;

pub use github::GitHubClient;
pub use gitlab::GitLabClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::governor::{RateBudget, RateGovernor};
use crate::model::{Provider, Upstream};

/// Client signature sent with every API request
pub const USER_AGENT: &str = concat!("ratatoskr/", env!("CARGO_PKG_VERSION"));

/// What a provider reported for a repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Newest release, else newest commit. `None` for a repository without any commit.
    pub latest: Option<Upstream>,
    /// Budget reported by the last response of the lookup
    pub rate: Option<RateBudget>,
}

/// Connection settings shared by the provider clients
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl ProviderSettings {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Capability implemented once per hosting provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider served by this client
    fn provider(&self) -> Provider;

    /// Latest release tag of `owner/name`, or its latest commit hash if it has no release
    async fn fetch_latest(&self, owner: &str, name: &str) -> Result<FetchOutcome, ProviderError>;
}

/// Header names a provider uses to report its rate limit window
pub(crate) struct RateHeaders {
    pub remaining: &'static str,
    pub reset: &'static str,
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Transient(format!("failed to build HTTP client: {}", e)))
}

/// Send a request and report any rate limit headers to the governor, whatever the status.
pub(crate) async fn send_observed(
    request: RequestBuilder,
    provider: Provider,
    governor: &RateGovernor,
    names: &RateHeaders,
) -> Result<(Response, Option<RateBudget>), ProviderError> {
    let response = request.send().await?;

    let rate = read_rate_budget(response.headers(), names);
    if let Some(budget) = rate {
        governor.record_response(provider, budget.remaining, budget.reset_at);
    }

    debug!("{} {} -> {}", provider, response.url().path(), response.status());
    Ok((response, rate))
}

pub(crate) fn read_rate_budget(headers: &HeaderMap, names: &RateHeaders) -> Option<RateBudget> {
    let remaining = header_number::<u64>(headers, names.remaining)?;
    let reset = header_number::<i64>(headers, names.reset)?;
    let reset_at = DateTime::from_timestamp(reset, 0)?;
    Some(RateBudget {
        remaining,
        reset_at,
    })
}

fn header_number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn retry_after(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let seconds = header_number::<i64>(headers, "retry-after")?;
    Some(Utc::now() + chrono::Duration::seconds(seconds))
}

/// Decode a JSON body, reporting malformed payloads as [`ProviderError::Decode`]
pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, ProviderError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// Map a non-success response onto the provider error taxonomy
pub(crate) async fn classify_failure(
    response: Response,
    rate: Option<RateBudget>,
) -> ProviderError {
    let status = response.status();
    let retry_at = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message = api_message(&body);

    let exhausted = rate.map(|r| r.remaining == 0).unwrap_or(false);
    let reset_at = retry_at.or_else(|| rate.map(|r| r.reset_at));

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Auth {
            status: status.as_u16(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { reset_at },
        StatusCode::FORBIDDEN if exhausted || retry_at.is_some() => {
            ProviderError::RateLimited { reset_at }
        }
        StatusCode::FORBIDDEN => ProviderError::Auth {
            status: status.as_u16(),
            message,
        },
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        s if s.is_server_error() => ProviderError::Transient(format!("{}: {}", s, message)),
        s => ProviderError::Api {
            status: s.as_u16(),
            message,
        },
    }
}

/// Pull the `message` field out of an API error body, falling back to the raw body
fn api_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string())
}
