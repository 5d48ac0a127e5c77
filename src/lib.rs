//! Ratatoskr - Release & Commit Watcher
//!
//! Ratatoskr keeps a local record of the latest release (or, for repositories that never
//! published one, the latest commit) of a curated list of GitHub and GitLab repositories
//! and announces every new one to a chat webhook exactly once.
//!
//! ## Core Features
//!
//! - **Reference list loading**: CSV ingestion with URL canonicalisation and deduplication
//! - **Provider clients**: GitHub and GitLab REST APIs behind one trait
//! - **Rate limit governance**: Per-provider budgets learned from response headers
//! - **Chat notifications**: Rocket.Chat, Slack, Discord and Microsoft Teams webhooks
//!
//! ## Modules
//!
//! - [`state`]: SQLite store of tracked repositories
//! - [`provider`]: Latest release/commit lookup per hosting provider
//! - [`governor`]: Rate budget tracking shared by all clients
//! - [`reconcile`]: Load and check workflows
//! - [`notify`]: Webhook delivery

pub mod config;
pub mod error;
pub mod governor;
pub mod health;
pub mod model;
pub mod notify;
pub mod provider;
pub mod reconcile;
pub mod reference;
pub mod state;

pub use config::Config;
pub use error::{CheckError, NotifyError, ProviderError, RepoUrlError, StoreError};
pub use governor::{RateBudget, RateGovernor};
pub use health::HealthCheck;
pub use model::{ChangeKind, NewRepository, Provider, TrackedRepository, TrackedSignal, Upstream};
pub use notify::{Notifier, Receiver, WebhookNotifier};
pub use provider::{FetchOutcome, GitHubClient, GitLabClient, ProviderClient, ProviderSettings};
pub use reconcile::{CheckResult, CheckSummary, LoadReport, ReconcileSettings, Reconciler};
pub use reference::{read_reference_list, ReferenceRecord};
pub use state::StateDb;
