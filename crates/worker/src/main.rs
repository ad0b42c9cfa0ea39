//! Lead Billing Background Worker
//!
//! Handles scheduled jobs:
//! - Usage report reconciliation for billable leads missing a Stripe record (every 15 minutes)
//! - Ledger invariant checks (daily at 3:00 AM UTC)

use std::sync::Arc;

use anyhow::Context;
use leadgen_billing::{
    InvariantCheckSummary, InvariantChecker, LeadEventLedger, PgLedgerStore, PortalKeyResolver,
    StripeClient, StripeConfig, StripeUsageBridge,
};
use leadgen_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RETRY_GRACE_MINUTES: i64 = 10;
const DEFAULT_RETRY_BATCH: i64 = 100;

struct WorkerConfig {
    database_url: String,
    stripe_secret_key: String,
    retry_grace: time::Duration,
    retry_batch: i64,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let number = |name: &str, default: i64| -> anyhow::Result<i64> {
            match var(name) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be an integer", name)),
                None => Ok(default),
            }
        };

        Ok(Self {
            database_url: var("DATABASE_URL").context("DATABASE_URL must be set")?,
            stripe_secret_key: var("STRIPE_SECRET_KEY").context("STRIPE_SECRET_KEY must be set")?,
            retry_grace: time::Duration::minutes(number(
                "USAGE_RETRY_GRACE_MINUTES",
                DEFAULT_RETRY_GRACE_MINUTES,
            )?),
            retry_batch: number("USAGE_RETRY_BATCH", DEFAULT_RETRY_BATCH)?,
        })
    }
}

/// Log results of an invariant run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Ledger invariants hold");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Ledger invariant violations found"
    );
    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = ?violation.severity,
            portal_keys = ?violation.portal_keys,
            description = %violation.description,
            "Invariant violation"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,leadgen_billing=debug")),
        )
        .init();

    info!("Starting Lead Billing Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    info!("Database pool created");

    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let stripe = StripeClient::new(StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        // Webhooks are only verified by the API
        webhook_secret: String::new(),
    });
    let ledger = Arc::new(LeadEventLedger::new(
        store,
        Arc::new(StripeUsageBridge::new(stripe)),
        PortalKeyResolver::default(),
    ));
    let checker = Arc::new(InvariantChecker::new(pool));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Re-report usage for billable leads with no Stripe usage record
    // Cron: every 15 minutes
    let retry_ledger = ledger.clone();
    let (retry_grace, retry_batch) = (config.retry_grace, config.retry_batch);
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let ledger = retry_ledger.clone();
            Box::pin(async move {
                info!("Running usage report reconciliation");
                match ledger.retry_unreported_usage(retry_grace, retry_batch).await {
                    Ok(summary) => info!(
                        attempted = summary.attempted,
                        reported = summary.reported,
                        failed = summary.failed,
                        "Usage reconciliation complete"
                    ),
                    Err(e) => error!(error = %e, "Usage reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage report reconciliation (every 15 minutes)");

    // Job 2: Ledger invariant checks
    // Cron: At 3:00 AM UTC daily
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (daily at 3:00 AM UTC)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Lead Billing Worker started with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    Ok(())
}
