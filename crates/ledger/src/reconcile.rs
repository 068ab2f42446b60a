//! Subscription reconciliation
//!
//! The gateway is the system of record for whether a subscription exists and
//! when it expires. Each pass walks every stored client, drops the ones the
//! gateway no longer knows and copies over a changed expiry or link. Local
//! values are never pushed back to the gateway.
//!
//! Lookups run without holding any lock. Each write then takes the agent
//! lock and re-reads the client, so a renewal or deletion that landed after
//! the listing is never overwritten with the gateway's older answer.

use std::sync::Arc;

use resell_shared::Client;
use serde::Serialize;

use crate::error::LedgerResult;
use crate::gateway::{GatewayUser, ProvisioningGateway};
use crate::store::{Store, StoreError};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub removed: usize,
    pub updated: usize,
    /// Clients changed locally between the listing and the write
    pub skipped: usize,
    /// Clients left untouched because the lookup or the write failed
    pub failed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.removed + self.updated
    }
}

enum Action {
    Remove,
    Update {
        expires_at: Option<time::OffsetDateTime>,
        subscription_link: Option<String>,
    },
    Keep,
}

enum Applied {
    Removed,
    Updated,
    Stale,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn ProvisioningGateway>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn ProvisioningGateway>) -> Self {
        Self { store, gateway }
    }

    /// One pass over all clients.
    ///
    /// Only listing the clients can fail the whole pass. A failure for a
    /// single client is logged and counted, and the client is retried on the
    /// next pass.
    pub async fn run_once(&self) -> LedgerResult<ReconcileReport> {
        let clients = self.store.list_clients(None).await?;
        let mut report = ReconcileReport {
            checked: clients.len(),
            ..Default::default()
        };

        for client in clients {
            let user = match self.gateway.lookup_by_username(&client.username).await {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!(
                        client_id = client.id,
                        username = %client.username,
                        error = %e,
                        "Gateway lookup failed, skipping client"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let action = plan(&client, user);
            if matches!(action, Action::Keep) {
                continue;
            }

            match self.apply(&client, action).await {
                Ok(Applied::Removed) => {
                    tracing::info!(
                        client_id = client.id,
                        agent_id = client.agent_id,
                        username = %client.username,
                        "Client missing in gateway, removed locally"
                    );
                    report.removed += 1;
                }
                Ok(Applied::Updated) => {
                    tracing::debug!(
                        client_id = client.id,
                        username = %client.username,
                        "Client synced from gateway"
                    );
                    report.updated += 1;
                }
                Ok(Applied::Stale) => {
                    tracing::debug!(
                        client_id = client.id,
                        username = %client.username,
                        "Client changed during the pass, left for the next one"
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(client_id = client.id, error = %e, "Failed to reconcile client");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            removed = report.removed,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Apply one planned change while holding the client's agent.
    async fn apply(&self, listed: &Client, action: Action) -> LedgerResult<Applied> {
        let mut tx = match self.store.begin_agent(listed.agent_id).await {
            Ok(tx) => tx,
            // The agent was deleted along with its clients
            Err(StoreError::NotFound(_)) => return Ok(Applied::Stale),
            Err(e) => return Err(e.into()),
        };

        match tx.client(listed.id).await? {
            Some(current) if unchanged(&current, listed) => {}
            _ => return Ok(Applied::Stale),
        }

        let applied = match action {
            Action::Remove => {
                tx.remove_client(listed.id).await?;
                Applied::Removed
            }
            Action::Update {
                expires_at,
                subscription_link,
            } => {
                tx.sync_client(listed.id, expires_at, subscription_link)
                    .await?;
                Applied::Updated
            }
            Action::Keep => return Ok(Applied::Stale),
        };
        tx.commit().await?;
        Ok(applied)
    }
}

/// The fields a pass reads and writes still hold the listed values.
fn unchanged(current: &Client, listed: &Client) -> bool {
    current.expires_at == listed.expires_at && current.subscription_link == listed.subscription_link
}

/// Decide what to do with one client given the gateway's view of it.
/// A field the gateway leaves empty keeps its local value.
fn plan(client: &Client, user: Option<GatewayUser>) -> Action {
    let Some(user) = user else {
        return Action::Remove;
    };

    let expires_at = user.expire_at.or(client.expires_at);
    let subscription_link = user
        .subscription_url
        .or_else(|| client.subscription_link.clone());

    if expires_at == client.expires_at && subscription_link == client.subscription_link {
        Action::Keep
    } else {
        Action::Update {
            expires_at,
            subscription_link,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CreateUser, ExtendUser, GatewayError, GatewayResult, InMemoryGateway};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use resell_shared::{NewAgent, NewClient, RenewalUpdate};
    use time::macros::datetime;
    use tokio::sync::Mutex;

    /// Answers lookups from a snapshot, but lets a renewal of the looked-up
    /// client commit before the answer reaches the pass.
    struct RenewingGateway {
        inner: InMemoryGateway,
        store: Arc<MemoryStore>,
        renewal: Mutex<Option<RenewalUpdate>>,
        agent_id: i64,
        // The renewal recreates the user in the gateway after the lookup
        recreate: Option<GatewayUser>,
    }

    #[async_trait]
    impl ProvisioningGateway for RenewingGateway {
        async fn lookup_by_username(&self, username: &str) -> GatewayResult<Option<GatewayUser>> {
            let snapshot = self.inner.lookup_by_username(username).await?;
            if let Some(update) = self.renewal.lock().await.take() {
                let mut tx = self.store.begin_agent(self.agent_id).await.unwrap();
                tx.apply_renewal(update).await.unwrap();
                tx.commit().await.unwrap();
                if let Some(user) = self.recreate.clone() {
                    self.inner.insert_user(user).await;
                }
            }
            Ok(snapshot)
        }

        async fn create(&self, request: &CreateUser) -> GatewayResult<GatewayUser> {
            self.inner.create(request).await
        }

        async fn extend(&self, request: &ExtendUser) -> GatewayResult<GatewayUser> {
            self.inner.extend(request).await
        }
    }

    fn renewal(client: &Client, expires_at: time::OffsetDateTime, link: &str) -> RenewalUpdate {
        RenewalUpdate {
            client_id: client.id,
            days: 30,
            expires_at,
            subscription_link: Some(link.to_string()),
            monthly_price: 300,
            payment_amount: 300,
            paid_at: datetime!(2025-01-09 12:00 UTC),
            tariff_name: None,
            tariff_base_price: 100,
            debt_amount: 100,
        }
    }

    async fn seed(store: &MemoryStore, usernames: &[&str]) -> Vec<Client> {
        let agent = store
            .get_or_create_agent(NewAgent {
                telegram_id: 500,
                name: "Agent".to_string(),
                telegram_username: None,
                credit_limit: 0,
                owner_share_percent: 100,
            })
            .await
            .unwrap();
        let mut tx = store.begin_agent(agent.id).await.unwrap();
        let mut clients = Vec::new();
        for username in usernames {
            let client = tx
                .insert_client(NewClient {
                    agent_id: agent.id,
                    telegram_id: None,
                    username: username.to_string(),
                    subscription_link: Some(format!("https://old/{}", username)),
                    expires_at: Some(datetime!(2025-01-10 00:00 UTC)),
                    monthly_price: 300,
                    last_payment_amount: None,
                    last_payment_at: None,
                    tariff_name: None,
                    tariff_base_price: None,
                })
                .await
                .unwrap();
            clients.push(client);
        }
        tx.commit().await.unwrap();
        clients
    }

    fn gateway_user(username: &str, expire_at: time::OffsetDateTime, url: &str) -> GatewayUser {
        GatewayUser {
            uuid: format!("uuid-{}", username),
            username: username.to_string(),
            expire_at: Some(expire_at),
            subscription_url: Some(url.to_string()),
        }
    }

    // =========================================================================
    // Plan Tests
    // =========================================================================

    #[tokio::test]
    async fn test_plan_keeps_local_value_when_gateway_field_empty() {
        let store = MemoryStore::new();
        let client = seed(&store, &["ivan_01"]).await.remove(0);

        let user = GatewayUser {
            uuid: "u".to_string(),
            username: "ivan_01".to_string(),
            expire_at: None,
            subscription_url: None,
        };
        assert!(matches!(plan(&client, Some(user)), Action::Keep));
        assert!(matches!(plan(&client, None), Action::Remove));
    }

    // =========================================================================
    // Pass Tests
    // =========================================================================

    #[tokio::test]
    async fn test_removes_missing_and_updates_changed() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(InMemoryGateway::new());
        let clients = seed(&store, &["gone_1", "same_1", "moved_1"]).await;

        gateway
            .insert_user(gateway_user(
                "same_1",
                datetime!(2025-01-10 00:00 UTC),
                "https://old/same_1",
            ))
            .await;
        gateway
            .insert_user(gateway_user(
                "moved_1",
                datetime!(2025-03-01 00:00 UTC),
                "https://new/moved_1",
            ))
            .await;

        let reconciler = Reconciler::new(store.clone(), gateway.clone());
        let report = reconciler.run_once().await.unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                checked: 3,
                removed: 1,
                updated: 1,
                skipped: 0,
                failed: 0,
            }
        );
        assert!(store.client_by_id(clients[0].id).await.unwrap().is_none());
        let moved = store.client_by_id(clients[2].id).await.unwrap().unwrap();
        assert_eq!(moved.expires_at, Some(datetime!(2025-03-01 00:00 UTC)));
        assert_eq!(moved.subscription_link.as_deref(), Some("https://new/moved_1"));
        assert_eq!(gateway.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_pass_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(InMemoryGateway::new());
        seed(&store, &["gone_1", "moved_1"]).await;
        gateway
            .insert_user(gateway_user(
                "moved_1",
                datetime!(2025-03-01 00:00 UTC),
                "https://new/moved_1",
            ))
            .await;

        let reconciler = Reconciler::new(store.clone(), gateway);
        let first = reconciler.run_once().await.unwrap();
        let second = reconciler.run_once().await.unwrap();

        assert_eq!(first.changed(), 2);
        assert_eq!(second.changed(), 0);
        assert_eq!(second.checked, 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_skips_only_that_client() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(InMemoryGateway::new());
        let clients = seed(&store, &["aaa_1", "bbb_1"]).await;
        gateway
            .fail_next(GatewayError::Transport("connection reset".to_string()))
            .await;

        let report = Reconciler::new(store.clone(), gateway)
            .run_once()
            .await
            .unwrap();

        // The first lookup fails, the second finds nothing and removes
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 1);
        let remaining = store.list_clients(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(clients.iter().any(|c| c.id == remaining[0].id));
    }

    // =========================================================================
    // Concurrent Renewal Tests
    // =========================================================================

    #[tokio::test]
    async fn test_stale_lookup_does_not_roll_back_renewal() {
        let store = Arc::new(MemoryStore::new());
        let client = seed(&store, &["ivan_01"]).await.remove(0);
        let inner = InMemoryGateway::new();
        // Gateway answer read before the renewal landed
        inner
            .insert_user(gateway_user(
                "ivan_01",
                datetime!(2025-01-20 00:00 UTC),
                "https://old/ivan_01",
            ))
            .await;

        let gateway = Arc::new(RenewingGateway {
            inner,
            store: store.clone(),
            renewal: Mutex::new(Some(renewal(
                &client,
                datetime!(2025-02-10 00:00 UTC),
                "https://renewed/ivan_01",
            ))),
            agent_id: client.agent_id,
            recreate: None,
        });

        let report = Reconciler::new(store.clone(), gateway)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.updated, 0);
        assert_eq!(report.skipped, 1);
        let stored = store.client_by_id(client.id).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(datetime!(2025-02-10 00:00 UTC)));
        assert_eq!(
            stored.subscription_link.as_deref(),
            Some("https://renewed/ivan_01")
        );
    }

    #[tokio::test]
    async fn test_client_recreated_during_pass_is_not_removed() {
        let store = Arc::new(MemoryStore::new());
        let client = seed(&store, &["ivan_01"]).await.remove(0);
        let recreated = gateway_user(
            "ivan_01",
            datetime!(2025-02-10 00:00 UTC),
            "https://renewed/ivan_01",
        );

        // The lookup misses, then the renewal recreates the user
        let gateway = Arc::new(RenewingGateway {
            inner: InMemoryGateway::new(),
            store: store.clone(),
            renewal: Mutex::new(Some(renewal(
                &client,
                datetime!(2025-02-10 00:00 UTC),
                "https://renewed/ivan_01",
            ))),
            agent_id: client.agent_id,
            recreate: Some(recreated),
        });

        let reconciler = Reconciler::new(store.clone(), gateway);
        let report = reconciler.run_once().await.unwrap();

        assert_eq!(report.removed, 0);
        assert_eq!(report.skipped, 1);
        assert!(store.client_by_id(client.id).await.unwrap().is_some());
        assert_eq!(store.renewals(client.agent_id).await.unwrap().len(), 1);

        // The next pass sees the recreated user and keeps the renewal
        let second = reconciler.run_once().await.unwrap();
        assert_eq!(second.changed(), 0);
        assert_eq!(second.skipped, 0);
    }
}
