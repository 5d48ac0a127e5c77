use async_trait::async_trait;
use reqwest::StatusCode;
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

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const RATE_HEADERS: RateHeaders = RateHeaders {
    remaining: "x-ratelimit-remaining",
    reset: "x-ratelimit-reset",
};

/// GitHub REST API client
pub struct GitHubClient {
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
    sha: String,
}

/// Result of one lookup step together with the budget its response reported
struct Step<T> {
    value: T,
    rate: Option<RateBudget>,
}

impl GitHubClient {
    pub fn new(settings: ProviderSettings, governor: Arc<RateGovernor>) -> Result<Self, ProviderError> {
        let client = build_http_client(settings.timeout)?;
        Ok(Self {
            client,
            settings,
            governor,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}{}", self.settings.api_url, path))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Tag of the latest published release, `None` when the repository has no release
    async fn latest_release(&self, owner: &str, name: &str) -> Result<Step<Option<String>>, ProviderError> {
        let request = self.get(&format!("/repos/{}/{}/releases/latest", owner, name));
        let (response, rate) =
            send_observed(request, Provider::GitHub, &self.governor, &RATE_HEADERS).await?;

        match response.status() {
            status if status.is_success() => {
                let release: ReleaseResponse = decode_json(response).await?;
                Ok(Step {
                    value: Some(release.tag_name),
                    rate,
                })
            }
            // Either no release or no repository; the commit lookup tells them apart
            StatusCode::NOT_FOUND => Ok(Step { value: None, rate }),
            _ => Err(classify_failure(response, rate).await),
        }
    }

    /// Hash of the newest commit on the default branch, `None` for an empty repository
    async fn latest_commit(&self, owner: &str, name: &str) -> Result<Step<Option<String>>, ProviderError> {
        let request = self
            .get(&format!("/repos/{}/{}/commits", owner, name))
            .query(&[("per_page", "1")]);
        let (response, rate) =
            send_observed(request, Provider::GitHub, &self.governor, &RATE_HEADERS).await?;

        match response.status() {
            status if status.is_success() => {
                let commits: Vec<CommitResponse> = decode_json(response).await?;
                Ok(Step {
                    value: commits.into_iter().next().map(|c| c.sha),
                    rate,
                })
            }
            // GitHub answers 409 Conflict for a repository without commits
            StatusCode::CONFLICT => Ok(Step { value: None, rate }),
            _ => Err(classify_failure(response, rate).await),
        }
    }
}

#[async_trait]
impl ProviderClient for GitHubClient {
    fn provider(&self) -> Provider {
        Provider::GitHub
    }

    async fn fetch_latest(&self, owner: &str, name: &str) -> Result<FetchOutcome, ProviderError> {
        let release = self.latest_release(owner, name).await?;
        if let Some(tag) = release.value {
            debug!("GitHub {}/{} latest release {}", owner, name, tag);
            return Ok(FetchOutcome {
                latest: Some(Upstream::Release(tag)),
                rate: release.rate,
            });
        }

        // The release lookup may have used up the budget
        if let Err(reset_at) = self.governor.try_call(Provider::GitHub) {
            debug!("GitHub budget exhausted before the commit lookup of {}/{}", owner, name);
            return Err(ProviderError::RateLimited { reset_at });
        }
        let commit = self.latest_commit(owner, name).await?;
        debug!("GitHub {}/{} has no release, latest commit {:?}", owner, name, commit.value);
        Ok(FetchOutcome {
            latest: commit.value.map(Upstream::Commit),
            rate: commit.rate.or(release.rate),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, governor: Arc<RateGovernor>) -> GitHubClient {
        GitHubClient::new(
            ProviderSettings::new(server.uri(), Some("ghp_test".to_string())),
            governor,
        )
        .unwrap()
    }

    fn rate_limited(template: ResponseTemplate, remaining: u64) -> ResponseTemplate {
        template
            .insert_header("x-ratelimit-remaining", remaining.to_string().as_str())
            .insert_header("x-ratelimit-reset", "4102444800")
    }

    #[tokio::test]
    async fn test_latest_release() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/releases/latest"))
            .and(header("Accept", "application/vnd.github+json"))
            .and(header("Authorization", "Bearer ghp_test"))
            .and(header("User-Agent", crate::provider::USER_AGENT))
            .respond_with(rate_limited(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"tag_name": "v2.0.0"})),
                4999,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let governor = Arc::new(RateGovernor::new());
        let outcome = client(&server, governor.clone())
            .fetch_latest("a", "b")
            .await
            .unwrap();

        assert_eq!(outcome.latest, Some(Upstream::Release("v2.0.0".into())));
        assert_eq!(outcome.rate.unwrap().remaining, 4999);
        assert_eq!(governor.budget(Provider::GitHub).unwrap().remaining, 4999);
    }

    #[tokio::test]
    async fn test_falls_back_to_latest_commit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/releases/latest"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Not Found"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/commits"))
            .and(query_param("per_page", "1"))
            .respond_with(rate_limited(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{"sha": "def456"}])),
                10,
            ))
            .mount(&server)
            .await;

        let outcome = client(&server, Arc::new(RateGovernor::new()))
            .fetch_latest("a", "b")
            .await
            .unwrap();

        assert_eq!(outcome.latest, Some(Upstream::Commit("def456".into())));
    }

    async fn release_missing_with_budget(server: &MockServer, remaining: u64, reset: i64) {
        Mock::given(method("GET"))
            .and(path("/repos/a/b/releases/latest"))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header("x-ratelimit-remaining", remaining.to_string().as_str())
                    .insert_header("x-ratelimit-reset", reset.to_string().as_str())
                    .set_body_json(serde_json::json!({"message": "Not Found"})),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_commit_lookup_is_held_back_by_exhausted_budget() {
        let server = MockServer::start().await;
        let reset = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp();
        release_missing_with_budget(&server, 0, reset).await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/commits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"sha": "abc"}])))
            .expect(0)
            .mount(&server)
            .await;

        let governor = Arc::new(RateGovernor::new());
        let result = client(&server, governor.clone()).fetch_latest("a", "b").await;

        assert_matches!(result, Err(ProviderError::RateLimited { reset_at: Some(t) }) if t.timestamp() == reset);
        assert_eq!(governor.budget(Provider::GitHub).unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_commit_lookup_proceeds_once_reset_has_passed() {
        let server = MockServer::start().await;
        let reset = (chrono::Utc::now() - chrono::Duration::seconds(1)).timestamp();
        release_missing_with_budget(&server, 0, reset).await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/commits"))
            .respond_with(rate_limited(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([{"sha": "abc"}])),
                5000,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let governor = Arc::new(RateGovernor::new());
        let outcome = client(&server, governor.clone())
            .fetch_latest("a", "b")
            .await
            .unwrap();

        assert_eq!(outcome.latest, Some(Upstream::Commit("abc".into())));
        assert_eq!(governor.budget(Provider::GitHub).unwrap().remaining, 5000);
    }

    #[tokio::test]
    async fn test_missing_repository_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Not Found"})))
            .mount(&server)
            .await;

        let result = client(&server, Arc::new(RateGovernor::new()))
            .fetch_latest("gone", "repo")
            .await;
        assert_matches!(result, Err(ProviderError::NotFound(msg)) if msg == "Not Found");
    }

    #[tokio::test]
    async fn test_empty_repository_has_no_signal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/empty/releases/latest"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/a/empty/commits"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({"message": "Git Repository is empty."})))
            .mount(&server)
            .await;

        let outcome = client(&server, Arc::new(RateGovernor::new()))
            .fetch_latest("a", "empty")
            .await
            .unwrap();
        assert_eq!(outcome.latest, None);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"message": "Bad credentials"})))
            .mount(&server)
            .await;

        let result = client(&server, Arc::new(RateGovernor::new()))
            .fetch_latest("a", "b")
            .await;
        assert_matches!(result, Err(ProviderError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_rate_limited_and_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(rate_limited(
                ResponseTemplate::new(403).set_body_json(serde_json::json!({"message": "API rate limit exceeded"})),
                0,
            ))
            .mount(&server)
            .await;

        let governor = Arc::new(RateGovernor::new());
        let result = client(&server, governor.clone()).fetch_latest("a", "b").await;

        assert_matches!(result, Err(ProviderError::RateLimited { reset_at: Some(t) }) if t.timestamp() == 4102444800);
        // Headers on the error response still reach the governor
        assert_eq!(governor.budget(Provider::GitHub).unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let result = client(&server, Arc::new(RateGovernor::new()))
            .fetch_latest("a", "b")
            .await;
        assert_matches!(result, Err(ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let result = client(&server, Arc::new(RateGovernor::new()))
            .fetch_latest("a", "b")
            .await;
        assert_matches!(result, Err(ProviderError::Decode(_)));
    }
}
