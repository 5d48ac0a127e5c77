use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ratatoskr::health::CheckResult as HealthResult;
use ratatoskr::{
    read_reference_list, CheckResult, Config, GitHubClient, GitLabClient, HealthCheck,
    NewRepository, Provider, RateGovernor, Receiver, ReconcileSettings, Reconciler, StateDb,
    TrackedSignal, WebhookNotifier,
};

#[derive(Parser)]
#[command(name = "ratatoskr")]
#[command(about = "Watch GitHub and GitLab repositories for new releases and commits")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load repositories from the reference list into the database
    Load {
        /// CSV reference list (defaults to reference_list from the configuration)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Check tracked repositories and notify about new releases and commits
    Check {
        /// Chat service receiving notifications
        #[arg(short, long, value_enum)]
        receiver: Option<Receiver>,
    },

    /// List tracked repositories
    List {
        /// Show repository details
        #[arg(long)]
        details: bool,
    },

    /// Stop tracking a repository
    Remove {
        /// Repository URL
        url: String,
    },

    /// System health check and diagnostics
    Doctor {
        /// Receiver whose webhook should be verified
        #[arg(short, long, value_enum)]
        receiver: Option<Receiver>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config)?;

    init_logging(cli.verbose, &config.logging.level)?;
    info!("Starting Ratatoskr v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Load { file } => cmd_load(file, &config),
        Commands::Check { receiver } => cmd_check(receiver, &config).await,
        Commands::List { details } => cmd_list(details, &config),
        Commands::Remove { url } => cmd_remove(url, &config),
        Commands::Doctor { receiver } => cmd_doctor(receiver, &config).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

fn open_store(config: &Config) -> Result<StateDb> {
    let path = config.database_path();
    StateDb::open_at(&path).with_context(|| format!("Failed to open database {:?}", path))
}

/// Load the reference list into the database
fn cmd_load(file: Option<PathBuf>, config: &Config) -> Result<()> {
    let path = file.unwrap_or_else(|| PathBuf::from(&config.reference_list));

    println!("📥 Loading repositories from {}", path.display());
    let records = read_reference_list(&path)?;

    let mut reconciler = Reconciler::new(open_store(config)?, Arc::new(RateGovernor::new()));
    let report = reconciler.load(&records)?;

    println!("\n🎉 Load Complete!");
    println!("   📊 Entries processed: {}", report.processed);
    println!("   ✅ Newly tracked: {}", report.inserted);
    println!("   ⏭️  Already tracked: {}", report.duplicates);
    println!("   ❌ Rejected: {}", report.rejected.len());

    if !report.rejected.is_empty() {
        println!("\n🔍 Rejected Entries:");
        for entry in &report.rejected {
            println!("   ❌ {}: {}", entry.url, entry.reason);
        }
    }

    Ok(())
}

/// Check tracked repositories for new releases and commits
async fn cmd_check(receiver: Option<Receiver>, config: &Config) -> Result<()> {
    let receiver = receiver
        .or(config.notify.receiver)
        .context("No receiver configured. Pass --receiver or set notify.receiver")?;

    let notifier = WebhookNotifier::from_env(
        receiver,
        &config.notify.webhook_env(receiver),
        config.notify.backoff()?,
        Path::new(&config.notify.spool_dir),
    )?;

    let governor = Arc::new(RateGovernor::new());
    let request_timeout = config.check.request_timeout();

    for (provider, section) in [(Provider::GitHub, &config.github), (Provider::GitLab, &config.gitlab)] {
        if section.token().is_none() {
            warn!("{} not set, {} requests are unauthenticated", section.token_env, provider);
        }
    }
    let github = GitHubClient::new(config.github.settings(request_timeout), governor.clone())?;
    let gitlab = GitLabClient::new(config.gitlab.settings(request_timeout), governor.clone())?;

    let settings = ReconcileSettings {
        run_timeout: config.check.run_timeout()?,
        retry_delay: config.check.retry_delay()?,
        rate_limit_backoff: config.check.rate_limit_backoff()?,
    };

    let mut reconciler = Reconciler::new(open_store(config)?, governor.clone())
        .with_client(Arc::new(github))
        .with_client(Arc::new(gitlab))
        .with_settings(settings);

    println!("🔍 Checking tracked repositories (notifying {})...", receiver);
    let summary = reconciler.check(&notifier).await?;

    for outcome in &summary.outcomes {
        if let CheckResult::Changed { kind, value } = &outcome.result {
            println!("   🆕 New {} for {}: {}", kind, outcome.url, value);
        }
    }

    println!("\n🎉 Check Complete!");
    println!("   📊 Total repositories: {}", summary.total);
    println!("   🆕 Changed: {}", summary.changed);
    println!("   ✅ Unchanged: {}", summary.unchanged);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    for provider in [Provider::GitHub, Provider::GitLab] {
        if let Some(budget) = governor.budget(provider) {
            println!(
                "   🚦 {} budget: {} remaining, resets {}",
                provider,
                budget.remaining,
                budget.reset_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    if summary.notify_failures > 0 {
        println!(
            "\n⚠️  {} notification(s) could not be delivered, saved to {}",
            summary.notify_failures,
            notifier.spool_path().display()
        );
    }

    if summary.failed > 0 {
        println!("\n🔍 Failed Repositories:");
        for (url, error) in summary.failures() {
            println!("   ❌ {}: {}", url, error);
        }
    }

    Ok(())
}

/// List tracked repositories
fn cmd_list(details: bool, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let repositories = store.list_all()?;

    println!("Tracked repositories ({}): ", repositories.len());

    for repo in repositories {
        if details {
            println!("📁 {}", repo.full_name());
            println!("   🔗 {}", repo.url);
            println!("   🏠 Provider: {}", repo.provider);
            if let Some(category) = &repo.category {
                println!("   🏷️  Category: {}", category);
            }
            if let Some(added) = &repo.added_date {
                println!("   📅 Added: {}", added);
            }
            match &repo.signal {
                TrackedSignal::Unknown => println!("   ❔ Not checked yet"),
                signal => println!("   📌 Latest {}", signal),
            }
            if let Some(checked) = repo.last_checked {
                println!("   🕒 Last change: {}", checked.format("%Y-%m-%d %H:%M"));
            }
            println!();
        } else {
            println!("  📁 {} ({})", repo.full_name(), repo.signal);
        }
    }

    Ok(())
}

/// Remove a repository from the database
fn cmd_remove(url: String, config: &Config) -> Result<()> {
    let canonical = NewRepository::from_url(&url)
        .map(|repo| repo.url)
        .unwrap_or(url);

    let mut store = open_store(config)?;
    if store.remove(&canonical)? {
        println!("✅ No longer tracking {}", canonical);
    } else {
        println!("⚠️  {} is not tracked", canonical);
    }

    Ok(())
}

/// System health check and diagnostics
async fn cmd_doctor(receiver: Option<Receiver>, config: &Config) -> Result<()> {
    let health = HealthCheck::run(config, receiver).await;
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &HealthResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 Ratatoskr System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
