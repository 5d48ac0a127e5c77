//! Reconciler - loads the reference list and checks tracked repositories for changes
//!
//! `load` only touches the store. `check` walks every tracked repository in insertion
//! order, asks its provider for the latest release or commit, persists any difference and
//! hands it to the notifier. A failure on one repository never stops the run; only store
//! errors do.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{CheckError, ProviderError, StoreResult};
use crate::governor::RateGovernor;
use crate::model::{ChangeKind, NewRepository, Provider, TrackedRepository};
use crate::notify::Notifier;
use crate::provider::{FetchOutcome, ProviderClient};
use crate::reference::ReferenceRecord;
use crate::state::StateDb;

/// Timing knobs of a check run
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Upper bound for waiting on rate limit resets across the whole run
    pub run_timeout: Duration,
    /// Pause before the single retry of a transient failure
    pub retry_delay: Duration,
    /// Suspension used when a provider refuses a call without a reset instant
    pub rate_limit_backoff: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(30 * 60),
            retry_delay: Duration::from_secs(2),
            rate_limit_backoff: Duration::from_secs(60),
        }
    }
}

/// A reference list entry that was not loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEntry {
    pub url: String,
    pub reason: String,
}

/// Results from a load operation
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub processed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedEntry>,
}

/// What happened to one repository during a check run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    Changed { kind: ChangeKind, value: String },
    Unchanged,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOutcome {
    pub url: String,
    pub result: CheckResult,
}

/// Results from a complete check run
#[derive(Debug, Clone)]
pub struct CheckSummary {
    pub total: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub notify_failures: usize,
    pub duration: Duration,
    pub outcomes: Vec<RepoOutcome>,
}

impl CheckSummary {
    /// Failed repositories with their error
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|outcome| match &outcome.result {
            CheckResult::Failed { error } => Some((outcome.url.as_str(), error.as_str())),
            _ => None,
        })
    }
}

/// Drives load and check against one store
pub struct Reconciler {
    store: StateDb,
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
    governor: Arc<RateGovernor>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(store: StateDb, governor: Arc<RateGovernor>) -> Self {
        Self {
            store,
            clients: HashMap::new(),
            governor,
            settings: ReconcileSettings::default(),
        }
    }

    /// Register the client used for repositories of its provider
    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn with_settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &StateDb {
        &self.store
    }

    /// Insert every reference entry that is not tracked yet. No network I/O.
    pub fn load(&mut self, records: &[ReferenceRecord]) -> StoreResult<LoadReport> {
        let mut report = LoadReport::default();

        for record in records {
            report.processed += 1;

            let repo = match NewRepository::from_url(&record.url) {
                Ok(repo) => repo,
                Err(e) => {
                    warn!("Skipping reference entry {}: {}", record.url, e);
                    report.rejected.push(RejectedEntry {
                        url: record.url.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let repo = match &record.category {
                Some(category) => repo.category(category),
                None => repo,
            };
            let repo = match &record.added_date {
                Some(date) => repo.added_date(date),
                None => repo,
            };

            if self.store.insert_if_absent(&repo)? {
                debug!("Now tracking {}", repo.url);
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }

        info!(
            "Load completed: {} processed, {} inserted, {} duplicates, {} rejected",
            report.processed,
            report.inserted,
            report.duplicates,
            report.rejected.len()
        );
        Ok(report)
    }

    /// Check every tracked repository once, persisting and announcing each change
    pub async fn check(&mut self, notifier: &dyn Notifier) -> StoreResult<CheckSummary> {
        let start_time = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.run_timeout;
        let repositories = self.store.list_all()?;
        let mut rejected_credentials: HashSet<Provider> = HashSet::new();
        let mut notify_failures = 0;
        let mut outcomes = Vec::with_capacity(repositories.len());

        info!("Checking {} tracked repositories", repositories.len());

        for repo in repositories {
            let fetched = if rejected_credentials.contains(&repo.provider) {
                Err(CheckError::CredentialsRejected(repo.provider))
            } else {
                self.fetch(&repo, deadline).await
            };

            let result = match fetched {
                Ok(outcome) => {
                    let change = outcome.latest.and_then(|latest| repo.signal.diff(&latest));
                    match change {
                        Some(change) => {
                            self.store.update_last_seen(repo.id, &change)?;
                            info!("New {} for repository {}: {}", change.kind, repo.full_name(), change.value);

                            if let Err(e) = notifier.notify(&repo, change.kind, &change.value).await {
                                warn!("Failed to notify about {}: {}", repo.full_name(), e);
                                notify_failures += 1;
                            }

                            CheckResult::Changed {
                                kind: change.kind,
                                value: change.value,
                            }
                        }
                        None => {
                            debug!("{} unchanged ({})", repo.full_name(), repo.signal);
                            CheckResult::Unchanged
                        }
                    }
                }
                Err(e) => {
                    if matches!(&e, CheckError::Provider(p) if p.is_auth()) {
                        warn!(
                            "{} credentials rejected, skipping its remaining repositories",
                            repo.provider
                        );
                        rejected_credentials.insert(repo.provider);
                    }
                    warn!("Failed to check {}: {}", repo.url, e);
                    CheckResult::Failed {
                        error: e.to_string(),
                    }
                }
            };

            outcomes.push(RepoOutcome {
                url: repo.url,
                result,
            });
        }

        let summary = compile_summary(outcomes, notify_failures, start_time.elapsed());
        info!(
            "Check completed in {:.2}s: {} changed, {} unchanged, {} failed",
            summary.duration.as_secs_f64(),
            summary.changed,
            summary.unchanged,
            summary.failed
        );
        Ok(summary)
    }

    /// Fetch the latest upstream state, retrying once after a rate limit or transient failure
    async fn fetch(
        &self,
        repo: &TrackedRepository,
        deadline: tokio::time::Instant,
    ) -> Result<FetchOutcome, CheckError> {
        let provider = repo.provider;
        let client = self
            .clients
            .get(&provider)
            .ok_or(CheckError::NoClient(provider))?;

        self.wait_for_budget(provider, deadline).await?;
        let first = self.attempt(client.as_ref(), repo).await;

        match first {
            Err(ProviderError::RateLimited { reset_at }) => {
                let until = reset_at.unwrap_or_else(|| {
                    Utc::now()
                        + chrono::Duration::from_std(self.settings.rate_limit_backoff)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60))
                });
                warn!(
                    "{} refused {} for exceeding its rate limit, retrying after {}",
                    provider,
                    repo.full_name(),
                    until.to_rfc3339()
                );
                self.governor.suspend_until(provider, until);
                self.wait_for_budget(provider, deadline).await?;
                Ok(self.attempt(client.as_ref(), repo).await?)
            }
            Err(ProviderError::Transient(message)) => {
                warn!(
                    "Transient failure for {}, retrying in {:.1}s: {}",
                    repo.full_name(),
                    self.settings.retry_delay.as_secs_f64(),
                    message
                );
                tokio::time::sleep(self.settings.retry_delay).await;
                self.wait_for_budget(provider, deadline).await?;
                Ok(self.attempt(client.as_ref(), repo).await?)
            }
            other => other.map_err(CheckError::from),
        }
    }

    async fn attempt(
        &self,
        client: &dyn ProviderClient,
        repo: &TrackedRepository,
    ) -> Result<FetchOutcome, ProviderError> {
        let result = client.fetch_latest(&repo.owner, &repo.name).await;
        self.governor.finish_call(repo.provider);
        result
    }

    async fn wait_for_budget(
        &self,
        provider: Provider,
        deadline: tokio::time::Instant,
    ) -> Result<(), CheckError> {
        tokio::time::timeout_at(deadline, self.governor.before_call(provider))
            .await
            .map_err(|_| CheckError::Deadline(provider))
    }
}

fn compile_summary(
    outcomes: Vec<RepoOutcome>,
    notify_failures: usize,
    duration: Duration,
) -> CheckSummary {
    let mut changed = 0;
    let mut unchanged = 0;
    let mut failed = 0;

    for outcome in &outcomes {
        match outcome.result {
            CheckResult::Changed { .. } => changed += 1,
            CheckResult::Unchanged => unchanged += 1,
            CheckResult::Failed { .. } => failed += 1,
        }
    }

    CheckSummary {
        total: outcomes.len(),
        changed,
        unchanged,
        failed,
        notify_failures,
        duration,
        outcomes,
    }
}
