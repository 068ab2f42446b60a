//! Expiry notifications
//!
//! Tells agents about client subscriptions that run out soon. A client is
//! announced once per expiry value, so a renewal re-arms the notice.

use std::sync::Arc;

use async_trait::async_trait;
use resell_shared::{Agent, Client, Config};
use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::error::LedgerResult;
use crate::pricing;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),

    #[error("notification transport failed: {0}")]
    Transport(String),
}

/// What an agent is told about one expiring client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiryNotice {
    pub agent_telegram_id: i64,
    pub username: String,
    pub days_left: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Delivery channel for expiry notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &ExpiryNotice) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sent: usize,
    pub skipped_inactive: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    notify_days: i64,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            notify_days: config.schedule.expiry_notify_days,
        }
    }

    /// Clients expiring in `(now, now + notify_days]` with no notice yet for
    /// their current expiry.
    pub async fn list_expiring(&self, now: OffsetDateTime) -> LedgerResult<Vec<(Client, Agent)>> {
        let until = now + Duration::days(self.notify_days);
        Ok(self.store.expiring_clients(now, until).await?)
    }

    /// Send one notice per expiring client. Failed sends stay unmarked and
    /// are retried on the next sweep.
    pub async fn notify_expiring(&self, notifier: &dyn Notifier) -> LedgerResult<SweepReport> {
        let now = OffsetDateTime::now_utc();
        let mut report = SweepReport::default();

        for (client, agent) in self.list_expiring(now).await? {
            let Some(expires_at) = client.expires_at else {
                continue;
            };
            if !agent.is_active {
                report.skipped_inactive += 1;
                continue;
            }

            let notice = ExpiryNotice {
                agent_telegram_id: agent.telegram_id,
                username: client.username.clone(),
                days_left: pricing::days_left(Some(expires_at), now),
                expires_at,
            };
            if let Err(e) = notifier.notify(&notice).await {
                tracing::warn!(
                    client_id = client.id,
                    agent_id = agent.id,
                    error = %e,
                    "Expiry notice not delivered"
                );
                report.failed += 1;
                continue;
            }

            if let Err(e) = self.store.mark_expiry_notified(client.id, expires_at).await {
                tracing::error!(client_id = client.id, error = %e, "Failed to mark expiry notice");
                report.failed += 1;
                continue;
            }
            report.sent += 1;
        }

        tracing::info!(
            sent = report.sent,
            skipped_inactive = report.skipped_inactive,
            failed = report.failed,
            "Expiry sweep complete"
        );
        Ok(report)
    }
}
