use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{
    build_http_client, classify_failure, decode_json, send_observed, FetchOutcome, ProviderClient,
    ProviderSettings, RateHeaders,
};
use crate::error::ProviderError;
use crate::governor::{RateBudget, RateGovernor};
use crate::model::{Provider, Upstream};

pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";

const RATE_HEADERS: RateHeaders = RateHeaders {
    remaining: "ratelimit-remaining",
    reset: "ratelimit-reset",
};

/// GitLab REST API (v4) client
pub struct GitLabClient {
    client: reqwest::Client,
    settings: ProviderSettings,
    governor: Arc<RateGovernor>,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    id: String,
}

/// Personal access token as described by `GET /personal_access_tokens/self`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
}

/// Project reference accepted by the API in place of a numeric id: the URL-encoded full path
pub(crate) fn project_id(owner: &str, name: &str) -> String {
    url::form_urlencoded::byte_serialize(format!("{}/{}", owner, name).as_bytes()).collect()
}

impl GitLabClient {
    pub fn new(settings: ProviderSettings, governor: Arc<RateGovernor>) -> Result<Self, ProviderError> {
        let client = build_http_client(settings.timeout)?;
        Ok(Self {
            client,
            settings,
            governor,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(format!("{}{}", self.settings.api_url, path));

        match &self.settings.token {
            Some(token) => request.header("PRIVATE-TOKEN", token),
            None => request,
        }
    }

    /// Details of the configured access token, as reported by the instance
    pub async fn token_info(&self) -> Result<TokenInfo, ProviderError> {
        let request = self.get("/personal_access_tokens/self");
        let (response, rate) =
            send_observed(request, Provider::GitLab, &self.governor, &RATE_HEADERS).await?;

        if !response.status().is_success() {
            return Err(classify_failure(response, rate).await);
        }
        decode_json(response).await
    }

    /// GET a project sub-resource and return its first element, if any
    async fn first_of<T: serde::de::DeserializeOwned>(
        &self,
        project: &str,
        resource: &str,
    ) -> Result<(Option<T>, Option<RateBudget>), ProviderError> {
        let request = self
            .get(&format!("/projects/{}/{}", project, resource))
            .query(&[("per_page", "1")]);
        let (response, rate) =
            send_observed(request, Provider::GitLab, &self.governor, &RATE_HEADERS).await?;

        if !response.status().is_success() {
            return Err(classify_failure(response, rate).await);
        }

        let items: Vec<T> = decode_json(response).await?;
        Ok((items.into_iter().next(), rate))
    }
}

#[async_trait]
impl ProviderClient for GitLabClient {
    fn provider(&self) -> Provider {
        Provider::GitLab
    }

    async fn fetch_latest(&self, owner: &str, name: &str) -> Result<FetchOutcome, ProviderError> {
        let project = project_id(owner, name);

        let (release, rate) = self
            .first_of::<ReleaseResponse>(&project, "releases")
            .await?;
        if let Some(release) = release {
            debug!("GitLab {}/{} latest release {}", owner, name, release.tag_name);
            return Ok(FetchOutcome {
                latest: Some(Upstream::Release(release.tag_name)),
                rate,
            });
        }

        // The release lookup may have used up the budget
        if let Err(reset_at) = self.governor.try_call(Provider::GitLab) {
            debug!("GitLab budget exhausted before the commit lookup of {}/{}", owner, name);
            return Err(ProviderError::RateLimited { reset_at });
        }
        let (commit, commit_rate) = self
            .first_of::<CommitResponse>(&project, "repository/commits")
            .await?;
        let latest = commit.map(|c| Upstream::Commit(c.id));
        debug!("GitLab {}/{} has no release, latest commit {:?}", owner, name, latest);

        Ok(FetchOutcome {
            latest,
            rate: commit_rate.or(rate),
        })
    }
}
