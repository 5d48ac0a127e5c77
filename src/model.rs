//! Tracked repository model
//!
//! A tracked repository is identified by its canonical URL. What we last saw upstream is
//! held in a [`TrackedSignal`]: either a release tag, a commit hash, or nothing yet.
//! Once a release has been seen, commits are no longer followed for that repository.

use chrono::{DateTime, Utc};
use std::fmt;
use url::Url;

use crate::error::RepoUrlError;

/// Upstream code hosting provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Provider::GitHub),
            "gitlab" => Some(Provider::GitLab),
            _ => None,
        }
    }

    /// Derive the provider from a (lowercase) URL host
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.strip_prefix("www.").unwrap_or(host);
        if host == "github.com" {
            Some(Provider::GitHub)
        } else if host.contains("gitlab") {
            Some(Provider::GitLab)
        } else {
            None
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::GitHub => write!(f, "GitHub"),
            Provider::GitLab => write!(f, "GitLab"),
        }
    }
}

/// Kind of upstream event a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Release,
    Commit,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Release => "release",
            ChangeKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest state reported by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Release(String),
    Commit(String),
}

/// A detected change, ready to be persisted and announced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub value: String,
}

impl Change {
    pub fn into_signal(self) -> TrackedSignal {
        match self.kind {
            ChangeKind::Release => TrackedSignal::Release(self.value),
            ChangeKind::Commit => TrackedSignal::Commit(self.value),
        }
    }
}

/// The last-seen upstream signal of a tracked repository
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrackedSignal {
    /// A release tag; commit tracking is inactive from here on
    Release(String),
    /// A commit hash; the repository has never shown a release
    Commit(String),
    /// Nothing observed yet
    #[default]
    Unknown,
}

impl TrackedSignal {
    /// Build from the two nullable columns of the store. A release always wins.
    pub fn from_columns(release: Option<String>, commit: Option<String>) -> Self {
        match (release, commit) {
            (Some(tag), _) => TrackedSignal::Release(tag),
            (None, Some(hash)) => TrackedSignal::Commit(hash),
            (None, None) => TrackedSignal::Unknown,
        }
    }

    /// Compare a fresh upstream observation against this signal.
    ///
    /// Returns `None` when nothing should be stored or announced.
    pub fn diff(&self, fetched: &Upstream) -> Option<Change> {
        match (self, fetched) {
            (TrackedSignal::Release(known), Upstream::Release(tag)) if known != tag => {
                Some(Change {
                    kind: ChangeKind::Release,
                    value: tag.clone(),
                })
            }
            (TrackedSignal::Release(_), _) => None,
            (_, Upstream::Release(tag)) => Some(Change {
                kind: ChangeKind::Release,
                value: tag.clone(),
            }),
            (TrackedSignal::Commit(known), Upstream::Commit(hash)) if known == hash => None,
            (_, Upstream::Commit(hash)) => Some(Change {
                kind: ChangeKind::Commit,
                value: hash.clone(),
            }),
        }
    }
}

impl fmt::Display for TrackedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedSignal::Release(tag) => write!(f, "release {}", tag),
            TrackedSignal::Commit(hash) => write!(f, "commit {}", hash),
            TrackedSignal::Unknown => write!(f, "not checked yet"),
        }
    }
}

/// A repository about to be inserted into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepository {
    pub url: String,
    pub provider: Provider,
    pub owner: String,
    pub name: String,
    pub category: Option<String>,
    pub added_date: Option<String>,
}

impl NewRepository {
    /// Parse and canonicalise a repository URL.
    ///
    /// GitHub URLs keep the first two path segments. GitLab URLs may name nested groups,
    /// so everything up to the `/-/` marker is kept and the last segment is the project.
    pub fn from_url(raw: &str) -> Result<Self, RepoUrlError> {
        let raw = raw.trim();
        let parsed = Url::parse(raw).map_err(|_| RepoUrlError::Invalid(raw.to_string()))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| RepoUrlError::Invalid(raw.to_string()))?
            .to_lowercase();
        let provider =
            Provider::from_host(&host).ok_or_else(|| RepoUrlError::UnsupportedHost(host.clone()))?;

        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let path: Vec<&str> = match provider {
            Provider::GitHub => segments.into_iter().take(2).collect(),
            Provider::GitLab => segments.into_iter().take_while(|seg| *seg != "-").collect(),
        };

        let Some((name, owner_parts)) = path.split_last() else {
            return Err(RepoUrlError::MissingPath(raw.to_string()));
        };
        let name = name.strip_suffix(".git").unwrap_or(name).to_string();
        let owner = owner_parts.join("/");
        if owner.is_empty() || name.is_empty() {
            return Err(RepoUrlError::MissingPath(raw.to_string()));
        }

        let host = host.strip_prefix("www.").unwrap_or(&host);
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let url = format!("{}://{}/{}/{}", parsed.scheme(), authority, owner, name);

        Ok(Self {
            url,
            provider,
            owner,
            name,
            category: None,
            added_date: None,
        })
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn added_date(mut self, added_date: impl Into<String>) -> Self {
        self.added_date = Some(added_date.into());
        self
    }
}

/// A repository as recorded in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRepository {
    pub id: i64,
    pub url: String,
    pub provider: Provider,
    pub owner: String,
    pub name: String,
    pub category: Option<String>,
    pub added_date: Option<String>,
    pub signal: TrackedSignal,
    pub last_checked: Option<DateTime<Utc>>,
}

impl TrackedRepository {
    /// Display name (owner/name format)
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Browser link to a release or commit of this repository
    pub fn web_link(&self, kind: ChangeKind, value: &str) -> String {
        match (self.provider, kind) {
            (Provider::GitHub, ChangeKind::Release) => format!("{}/releases/tag/{}", self.url, value),
            (Provider::GitHub, ChangeKind::Commit) => format!("{}/commit/{}", self.url, value),
            (Provider::GitLab, ChangeKind::Release) => format!("{}/-/releases/{}", self.url, value),
            (Provider::GitLab, ChangeKind::Commit) => format!("{}/-/commit/{}", self.url, value),
        }
    }
}
