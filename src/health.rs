//! System health checks for Ratatoskr
//!
//! This module provides preflight checks to verify the database, the provider tokens and
//! the webhook are usable before running a check.

use octocrab::Octocrab;
use std::sync::Arc;

use crate::config::Config;
use crate::governor::RateGovernor;
use crate::notify::Receiver;
use crate::provider::GitLabClient;
use crate::state::StateDb;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Database schema status
    pub database: CheckResult,
    /// GitHub token status
    pub github_auth: CheckResult,
    /// GitLab token status
    pub gitlab_auth: CheckResult,
    /// Webhook configuration (warning only, not required)
    pub webhook: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config, receiver: Option<Receiver>) -> Self {
        Self {
            database: Self::check_database(config),
            github_auth: Self::check_github_auth(config).await,
            gitlab_auth: Self::check_gitlab_auth(config).await,
            webhook: Self::check_webhook(config, receiver),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.database.passed && self.github_auth.passed && self.gitlab_auth.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check the database opens with a compatible schema
    fn check_database(config: &Config) -> CheckResult {
        let path = config.database_path();
        let opened = StateDb::open_at(&path).and_then(|db| db.count());

        match opened {
            Ok(count) => CheckResult::ok_with_details(
                "Database ready",
                format!("{} ({} tracked repositories)", path.display(), count),
            ),
            Err(e) => CheckResult::error_with_details(
                "Database unusable",
                format!("{}\n{}", path.display(), e),
            ),
        }
    }

    /// Check the GitHub token is accepted and report the remaining core budget
    async fn check_github_auth(config: &Config) -> CheckResult {
        let Some(token) = config.github.token() else {
            return CheckResult::warning_with_details(
                "No GitHub token",
                format!(
                    "Unauthenticated requests are limited to 60 per hour. Set {}",
                    config.github.token_env
                ),
            );
        };

        let client = match Octocrab::builder()
            .personal_token(token)
            .base_uri(config.github.api_url.as_str())
            .and_then(|builder| builder.build())
        {
            Ok(client) => client,
            Err(e) => {
                return CheckResult::error_with_details("Failed to create GitHub client", e.to_string())
            }
        };

        let user = match client.current().user().await {
            Ok(user) => user,
            Err(e) => {
                return CheckResult::error_with_details(
                    "GitHub token rejected",
                    format!("{}\nCheck {}", e, config.github.token_env),
                )
            }
        };

        let budget = match client.ratelimit().get().await {
            Ok(limits) => format!(
                "{} of {} core requests remaining",
                limits.resources.core.remaining, limits.resources.core.limit
            ),
            Err(e) => format!("rate limit unknown: {}", e),
        };

        CheckResult::ok_with_details(
            "GitHub authentication successful",
            format!("Username: {}\n{}", user.login, budget),
        )
    }

    /// Check the GitLab token is accepted
    async fn check_gitlab_auth(config: &Config) -> CheckResult {
        let settings = config.gitlab.settings(config.check.request_timeout());
        if settings.token.is_none() {
            return CheckResult::warning_with_details(
                "No GitLab token",
                format!("Only public projects can be checked. Set {}", config.gitlab.token_env),
            );
        }

        let client = match GitLabClient::new(settings, Arc::new(RateGovernor::new())) {
            Ok(client) => client,
            Err(e) => {
                return CheckResult::error_with_details("Failed to create GitLab client", e.to_string())
            }
        };

        match client.token_info().await {
            Ok(info) => {
                let mut details = format!("Token: {} (scopes: {})", info.name, info.scopes.join(", "));
                if let Some(expires_at) = info.expires_at {
                    details.push_str(&format!("\nExpires: {}", expires_at));
                }
                CheckResult::ok_with_details("GitLab authentication successful", details)
            }
            Err(e) => CheckResult::error_with_details(
                "GitLab token rejected",
                format!("{}\nCheck {}", e, config.gitlab.token_env),
            ),
        }
    }

    /// Check a webhook URL is available for the receiver (warning only)
    fn check_webhook(config: &Config, receiver: Option<Receiver>) -> CheckResult {
        let Some(receiver) = receiver.or(config.notify.receiver) else {
            return CheckResult::warning_with_details(
                "No receiver configured",
                "Pass --receiver to check or set notify.receiver",
            );
        };

        let env_name = config.notify.webhook_env(receiver);
        match std::env::var(&env_name) {
            Ok(url) if !url.trim().is_empty() => CheckResult::ok_with_details(
                format!("{} webhook configured", receiver),
                env_name,
            ),
            _ => CheckResult::warning_with_details(
                format!("{} webhook missing", receiver),
                format!("Set {} before running check", env_name),
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Database", &self.database),
            ("GitHub Authentication", &self.github_auth),
            ("GitLab Authentication", &self.gitlab_auth),
            ("Webhook", &self.webhook),
        ]
    }
}
