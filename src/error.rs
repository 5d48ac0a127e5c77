//! Error types for the store, the provider clients and notification dispatch

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::Provider;

/// Errors raised by the persistent store. All of them are fatal to a workflow run.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database holds a structure this build cannot work with.
    #[error("incompatible database schema: {0}")]
    Schema(String),

    /// No tracked repository carries the given id.
    #[error("no tracked repository with id {0}")]
    NotFound(i64),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by a provider client for a single repository.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The repository does not exist upstream (any more).
    #[error("repository not found upstream: {0}")]
    NotFound(String),

    /// The token was rejected or lacks access.
    #[error("credentials rejected ({status}): {message}")]
    Auth { status: u16, message: String },

    /// The provider itself reported an exhausted budget.
    #[error("rate limited by provider{}", until_suffix(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Network failure or 5xx answer; worth one more attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other unexpected status code.
    #[error("unexpected API response {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode API response: {0}")]
    Decode(String),
}

fn until_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
    reset_at
        .map(|t| format!(" until {}", t.to_rfc3339()))
        .unwrap_or_default()
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Why a single repository could not be checked during a run.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("run deadline reached while waiting for the {0} rate limit to reset")]
    Deadline(Provider),

    /// Credentials for the provider were rejected earlier in the same run.
    #[error("skipped: {0} credentials were rejected earlier in this run")]
    CredentialsRejected(Provider),

    #[error("no client configured for {0}")]
    NoClient(Provider),
}

/// Errors raised while delivering a notification.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The receiver answered with a non-success status.
    #[error("webhook rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The undelivered message could not be written to the spool file either.
    #[error("failed to spool undelivered message: {0}")]
    Spool(String),

    #[error("no webhook URL configured: set {0}")]
    MissingWebhook(String),
}

/// A reference list entry that cannot be tracked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoUrlError {
    #[error("not a valid URL: {0}")]
    Invalid(String),

    #[error("unsupported hosting provider '{0}'")]
    UnsupportedHost(String),

    #[error("URL does not name an owner and repository: {0}")]
    MissingPath(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
