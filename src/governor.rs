//! Rate Governor - per-provider call budget tracking
//!
//! Providers are the source of truth for the remaining budget: every response overwrites
//! what we know. When the budget is exhausted, callers are suspended until the reset
//! instant. After the reset, a single call is let through to learn the new budget; other
//! callers for the same provider wait until that response has been recorded.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::model::Provider;

/// Remaining calls in the current window of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProviderState {
    budget: Option<RateBudget>,
    /// A post-reset probe call is in flight and no fresh budget has been recorded yet
    probing: bool,
}

enum Gate {
    Open,
    SleepUntil(DateTime<Utc>),
    AwaitRefresh,
}

/// Shared rate budget for all providers of a run
#[derive(Debug, Default)]
pub struct RateGovernor {
    state: Mutex<HashMap<Provider, ProviderState>>,
    refreshed: Notify,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a call to `provider` is allowed.
    ///
    /// Returns immediately while budget remains or when nothing is known yet.
    pub async fn before_call(&self, provider: Provider) {
        loop {
            let notified = self.refreshed.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a refresh in between is not lost
            notified.as_mut().enable();

            match self.gate(provider, Utc::now()) {
                Gate::Open => return,
                Gate::SleepUntil(reset_at) => {
                    let wait = (reset_at - Utc::now()).to_std().unwrap_or_default();
                    info!(
                        "{} rate limit exhausted, pausing {:.0}s until {}",
                        provider,
                        wait.as_secs_f64(),
                        reset_at.to_rfc3339()
                    );
                    tokio::time::sleep(wait).await;
                }
                Gate::AwaitRefresh => {
                    debug!("Waiting for fresh {} rate budget", provider);
                    notified.await;
                }
            }
        }
    }

    /// Non-blocking [`before_call`](Self::before_call) for follow-up requests within one lookup.
    ///
    /// `Err` carries the instant the budget resets, `None` while another call probes it.
    pub fn try_call(&self, provider: Provider) -> Result<(), Option<DateTime<Utc>>> {
        match self.gate(provider, Utc::now()) {
            Gate::Open => Ok(()),
            Gate::SleepUntil(reset_at) => Err(Some(reset_at)),
            Gate::AwaitRefresh => Err(None),
        }
    }

    fn gate(&self, provider: Provider, now: DateTime<Utc>) -> Gate {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(provider).or_default();

        match entry.budget {
            None => Gate::Open,
            Some(budget) if budget.remaining > 0 => Gate::Open,
            Some(budget) if now < budget.reset_at => Gate::SleepUntil(budget.reset_at),
            Some(_) if entry.probing => Gate::AwaitRefresh,
            Some(_) => {
                entry.probing = true;
                Gate::Open
            }
        }
    }

    /// Overwrite the budget with what the provider just reported
    pub fn record_response(&self, provider: Provider, remaining: u64, reset_at: DateTime<Utc>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.entry(provider).or_default();
            entry.budget = Some(RateBudget {
                remaining,
                reset_at,
            });
            entry.probing = false;
        }
        debug!(
            "{} rate budget: {} remaining, resets at {}",
            provider,
            remaining,
            reset_at.to_rfc3339()
        );
        self.refreshed.notify_waiters();
    }

    /// Force a suspension after the provider refused a call for exceeding its limit
    pub fn suspend_until(&self, provider: Provider, until: DateTime<Utc>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.entry(provider).or_default();
            let reset_at = match entry.budget {
                Some(budget) if budget.reset_at > until => budget.reset_at,
                _ => until,
            };
            entry.budget = Some(RateBudget {
                remaining: 0,
                reset_at,
            });
            entry.probing = false;
        }
        self.refreshed.notify_waiters();
    }

    /// Mark the current call to `provider` as finished.
    ///
    /// A probe whose response carried no rate headers never refreshes the budget; releasing
    /// it lets the next caller probe instead of waiting forever.
    pub fn finish_call(&self, provider: Provider) {
        let released = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.get_mut(&provider) {
                Some(entry) if entry.probing => {
                    entry.probing = false;
                    true
                }
                _ => false,
            }
        };
        if released {
            self.refreshed.notify_waiters();
        }
    }

    /// Last known budget for a provider
    pub fn budget(&self, provider: Provider) -> Option<RateBudget> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(&provider).and_then(|entry| entry.budget)
    }
}
