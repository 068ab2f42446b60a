// Worker clippy configuration
#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Resell Background Worker
//!
//! Handles scheduled jobs including:
//! - Reconciliation of local subscriptions against the gateway (every `SYNC_INTERVAL_SECONDS`)
//! - Expiry notices to agents (every `EXPIRY_NOTIFY_INTERVAL_SECONDS`, needs `BOT_TOKEN`)
//! - Ledger invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

mod telegram;

use std::sync::Arc;

use resell_ledger::{
    ExpirySweeper, InvariantCheckSummary, InvariantChecker, Notifier, Reconciler,
    ResellerService, ViolationSeverity,
};
use resell_shared::{create_pool, run_migrations, Config};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::telegram::TelegramNotifier;

async fn run_reconcile(reconciler: &Reconciler) {
    match reconciler.run_once().await {
        Ok(report) if report.changed() > 0 || report.skipped > 0 || report.failed > 0 => info!(
            checked = report.checked,
            removed = report.removed,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation finished"
        ),
        Ok(report) => info!(checked = report.checked, "Reconciliation found nothing to change"),
        Err(e) => error!(error = %e, "Reconciliation failed"),
    }
}

async fn run_expiry_sweep(sweeper: &ExpirySweeper, notifier: &dyn Notifier) {
    match sweeper.notify_expiring(notifier).await {
        Ok(report) if report.sent > 0 || report.failed > 0 => info!(
            sent = report.sent,
            skipped_inactive = report.skipped_inactive,
            failed = report.failed,
            "Expiry notices sent"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Expiry sweep failed"),
    }
}

fn notifier_from_config(token: &str, config: &Config) -> Result<TelegramNotifier, reqwest::Error> {
    let notifier = TelegramNotifier::new(token)?;
    Ok(match config.expiry_template.as_deref() {
        Some(template) => notifier.with_template(template),
        None => notifier,
    })
}

/// Log results of an invariant run
fn log_invariant_results(summary: &InvariantCheckSummary) {
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
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                agent_ids = ?violation.agent_ids,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
            _ => warn!(
                invariant = %violation.invariant,
                agent_ids = ?violation.agent_ids,
                severity = %violation.severity,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Resell Worker");

    let config = Arc::new(Config::from_env()?);
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let service = ResellerService::connect(pool.clone(), config.clone())?;
    let checker = Arc::new(InvariantChecker::new(pool));

    // First pass right away so a restart does not wait a full interval
    run_reconcile(&service.reconciler).await;

    let mut scheduler = JobScheduler::new().await?;
    let mut jobs = 0;

    // Job 1: Reconcile local subscriptions with the gateway
    let reconciler = service.reconciler.clone();
    scheduler
        .add(Job::new_repeated_async(
            config.schedule.sync_interval,
            move |_uuid, _l| {
                let reconciler = reconciler.clone();
                Box::pin(async move {
                    run_reconcile(&reconciler).await;
                })
            },
        )?)
        .await?;
    jobs += 1;
    info!(
        interval_secs = config.schedule.sync_interval.as_secs(),
        "Scheduled: Gateway reconciliation"
    );

    // Job 2: Expiry notices, only with a bot to send them
    match config.bot_token.as_deref() {
        Some(token) => {
            let notifier: Arc<dyn Notifier> = Arc::new(notifier_from_config(token, &config)?);
            let sweeper = service.expiry.clone();
            scheduler
                .add(Job::new_repeated_async(
                    config.schedule.expiry_notify_interval,
                    move |_uuid, _l| {
                        let sweeper = sweeper.clone();
                        let notifier = notifier.clone();
                        Box::pin(async move {
                            run_expiry_sweep(&sweeper, notifier.as_ref()).await;
                        })
                    },
                )?)
                .await?;
            jobs += 1;
            info!(
                interval_secs = config.schedule.expiry_notify_interval.as_secs(),
                notify_days = config.schedule.expiry_notify_days,
                "Scheduled: Expiry notices"
            );
        }
        None => warn!("BOT_TOKEN not set - expiry notices disabled"),
    }

    // Job 3: Ledger invariants at the top of every hour
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_results(&summary),
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Ledger invariant checks (hourly)");

    // Job 4: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Resell Worker started successfully with {} scheduled jobs", jobs);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    scheduler.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use resell_ledger::ExpiryNotice;
    use time::macros::datetime;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let mut vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://localhost/resell_test"),
            ("REMNAWAVE_BASE_URL", "http://127.0.0.1:9"),
            ("REMNAWAVE_API_KEY", "test"),
        ]
        .into_iter()
        .collect();
        vars.extend(pairs.iter().copied());
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    fn notice() -> ExpiryNotice {
        ExpiryNotice {
            agent_telegram_id: 500,
            username: "ivan_01".to_string(),
            days_left: 2,
            expires_at: datetime!(2026-03-05 12:00 UTC),
        }
    }

    #[test]
    fn test_notifier_uses_configured_template() {
        let config = config(&[("TEXT_SUBSCRIPTION_EXPIRING", "{username}\\n{days_left}")]);
        let notifier = notifier_from_config("token", &config).unwrap();
        assert_eq!(notifier.render(&notice()), "ivan_01\n2");
    }

    #[test]
    fn test_notifier_falls_back_to_default_template() {
        let notifier = notifier_from_config("token", &config(&[])).unwrap();
        assert!(notifier.render(&notice()).contains("через 2 дн."));
    }
}
