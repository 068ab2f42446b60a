//! Postgres store
//!
//! Agent-scoped transactions start with `SELECT ... FOR UPDATE` on the agent
//! row and keep it locked until commit or rollback.

use async_trait::async_trait;
use resell_shared::{
    Agent, AgentOverview, Client, DebtEvent, NewAgent, NewClient, Renewal, RenewalUpdate,
    TransferRequest, TransferStatus,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use super::{AgentTx, DeletedAgent, Store, StoreError, StoreResult};

const AGENT_COLUMNS: &str = "id, telegram_id, name, telegram_username, is_active, \
     credit_limit, current_debt, owner_share_percent, created_at";

const CLIENT_COLUMNS: &str = "id, agent_id, telegram_id, username, subscription_link, \
     expires_at, monthly_price, last_payment_amount, last_payment_at, tariff_name, \
     tariff_base_price, expires_notified_for, created_at";

const TRANSFER_COLUMNS: &str = "id, agent_id, amount, status, created_at, decided_at";

/// Row type for transfer requests; status is stored as text
#[derive(Debug, FromRow)]
struct TransferRow {
    id: i64,
    agent_id: i64,
    amount: i64,
    status: String,
    created_at: OffsetDateTime,
    decided_at: Option<OffsetDateTime>,
}

impl TryFrom<TransferRow> for TransferRequest {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        let status = TransferStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Database(format!(
                "transfer request {} has unknown status {:?}",
                row.id, row.status
            ))
        })?;
        Ok(TransferRequest {
            id: row.id,
            agent_id: row.agent_id,
            amount: row.amount,
            status,
            created_at: row.created_at,
            decided_at: row.decided_at,
        })
    }
}

/// Store backed by the shared Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_or_create_agent(&self, new: NewAgent) -> StoreResult<Agent> {
        let sql = format!(
            r#"
            INSERT INTO agents (telegram_id, name, telegram_username, credit_limit, owner_share_percent)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (telegram_id) DO UPDATE
                SET telegram_username = COALESCE(EXCLUDED.telegram_username, agents.telegram_username)
            RETURNING {}
            "#,
            AGENT_COLUMNS
        );
        let agent = sqlx::query_as::<_, Agent>(&sql)
            .bind(new.telegram_id)
            .bind(&new.name)
            .bind(&new.telegram_username)
            .bind(new.credit_limit)
            .bind(new.owner_share_percent)
            .fetch_one(&self.pool)
            .await?;
        Ok(agent)
    }

    async fn agent_by_id(&self, agent_id: i64) -> StoreResult<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents WHERE id = $1", AGENT_COLUMNS);
        Ok(sqlx::query_as::<_, Agent>(&sql)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn agent_by_telegram_id(&self, telegram_id: i64) -> StoreResult<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents WHERE telegram_id = $1", AGENT_COLUMNS);
        Ok(sqlx::query_as::<_, Agent>(&sql)
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentOverview>> {
        let rows = sqlx::query_as::<_, AgentOverview>(
            r#"
            SELECT a.id, a.telegram_id, a.name, a.telegram_username, a.is_active,
                   a.credit_limit, a.current_debt, a.owner_share_percent, a.created_at,
                   COUNT(c.id) AS client_count
            FROM agents a
            LEFT JOIN clients c ON c.agent_id = a.id
            GROUP BY a.id
            ORDER BY a.created_at, a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_credit_limit(
        &self,
        agent_id: i64,
        credit_limit: i64,
    ) -> StoreResult<Option<Agent>> {
        let sql = format!(
            "UPDATE agents SET credit_limit = $2 WHERE id = $1 RETURNING {}",
            AGENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Agent>(&sql)
            .bind(agent_id)
            .bind(credit_limit)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_agent_active(&self, agent_id: i64, is_active: bool) -> StoreResult<Option<Agent>> {
        let sql = format!(
            "UPDATE agents SET is_active = $2 WHERE id = $1 RETURNING {}",
            AGENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Agent>(&sql)
            .bind(agent_id)
            .bind(is_active)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_agent(&self, agent_id: i64) -> StoreResult<Option<DeletedAgent>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM agents WHERE id = $1 FOR UPDATE",
            AGENT_COLUMNS
        );
        let Some(agent) = sqlx::query_as::<_, Agent>(&sql)
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let clients_removed = sqlx::query("DELETE FROM clients WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Remaining history goes with the agent row through ON DELETE CASCADE
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(DeletedAgent {
            agent,
            clients_removed,
        }))
    }

    async fn debt_events(&self, agent_id: i64) -> StoreResult<Vec<DebtEvent>> {
        Ok(sqlx::query_as::<_, DebtEvent>(
            r#"
            SELECT id, agent_id, amount, reason, created_at
            FROM debt_events
            WHERE agent_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn renewals(&self, agent_id: i64) -> StoreResult<Vec<Renewal>> {
        Ok(sqlx::query_as::<_, Renewal>(
            r#"
            SELECT id, agent_id, client_id, days, debt_amount, payment_amount, created_at
            FROM renewals
            WHERE agent_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn client_by_id(&self, client_id: i64) -> StoreResult<Option<Client>> {
        let sql = format!("SELECT {} FROM clients WHERE id = $1", CLIENT_COLUMNS);
        Ok(sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn client_by_username(
        &self,
        agent_id: i64,
        username: &str,
    ) -> StoreResult<Option<Client>> {
        let sql = format!(
            "SELECT {} FROM clients WHERE agent_id = $1 AND username = $2",
            CLIENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Client>(&sql)
            .bind(agent_id)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_clients(&self, agent_id: Option<i64>) -> StoreResult<Vec<Client>> {
        let sql = format!(
            "SELECT {} FROM clients WHERE ($1::BIGINT IS NULL OR agent_id = $1) ORDER BY id",
            CLIENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Client>(&sql)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn delete_client(&self, client_id: i64) -> StoreResult<Option<Client>> {
        let sql = format!(
            "DELETE FROM clients WHERE id = $1 RETURNING {}",
            CLIENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn expiring_clients(
        &self,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> StoreResult<Vec<(Client, Agent)>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM clients
            WHERE expires_at IS NOT NULL
              AND expires_at > $1
              AND expires_at <= $2
              AND (expires_notified_for IS NULL OR expires_notified_for <> expires_at)
            ORDER BY expires_at, username
            "#,
            CLIENT_COLUMNS
        );
        let clients = sqlx::query_as::<_, Client>(&sql)
            .bind(from)
            .bind(until)
            .fetch_all(&self.pool)
            .await?;
        if clients.is_empty() {
            return Ok(Vec::new());
        }

        let mut agent_ids: Vec<i64> = clients.iter().map(|c| c.agent_id).collect();
        agent_ids.sort_unstable();
        agent_ids.dedup();

        let sql = format!("SELECT {} FROM agents WHERE id = ANY($1)", AGENT_COLUMNS);
        let agents = sqlx::query_as::<_, Agent>(&sql)
            .bind(&agent_ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(clients
            .into_iter()
            .filter_map(|client| {
                agents
                    .iter()
                    .find(|a| a.id == client.agent_id)
                    .map(|agent| (client, agent.clone()))
            })
            .collect())
    }

    async fn mark_expiry_notified(
        &self,
        client_id: i64,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE clients SET expires_notified_for = $2 WHERE id = $1")
            .bind(client_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_transfer(&self, agent_id: i64, amount: i64) -> StoreResult<TransferRequest> {
        let sql = format!(
            "INSERT INTO transfer_requests (agent_id, amount) VALUES ($1, $2) RETURNING {}",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(agent_id)
            .bind(amount)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    StoreError::NotFound(format!("agent {}", agent_id))
                }
                _ => StoreError::from(e),
            })?;
        row.try_into()
    }

    async fn transfer_by_id(&self, request_id: i64) -> StoreResult<Option<TransferRequest>> {
        let sql = format!(
            "SELECT {} FROM transfer_requests WHERE id = $1",
            TRANSFER_COLUMNS
        );
        sqlx::query_as::<_, TransferRow>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn pending_transfers(&self) -> StoreResult<Vec<TransferRequest>> {
        let sql = format!(
            "SELECT {} FROM transfer_requests WHERE status = 'pending' ORDER BY created_at, id",
            TRANSFER_COLUMNS
        );
        sqlx::query_as::<_, TransferRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn begin_agent(&self, agent_id: i64) -> StoreResult<Box<dyn AgentTx>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM agents WHERE id = $1 FOR UPDATE",
            AGENT_COLUMNS
        );
        let agent = sqlx::query_as::<_, Agent>(&sql)
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("agent {}", agent_id)))?;

        Ok(Box::new(PgAgentTx { tx, agent }))
    }
}

struct PgAgentTx {
    tx: Transaction<'static, Postgres>,
    agent: Agent,
}

#[async_trait]
impl AgentTx for PgAgentTx {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    async fn client(&mut self, client_id: i64) -> StoreResult<Option<Client>> {
        let sql = format!(
            "SELECT {} FROM clients WHERE id = $1 AND agent_id = $2 FOR UPDATE",
            CLIENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .bind(self.agent.id)
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    async fn insert_client(&mut self, client: NewClient) -> StoreResult<Client> {
        let sql = format!(
            r#"
            INSERT INTO clients (
                agent_id, telegram_id, username, subscription_link, expires_at,
                monthly_price, last_payment_amount, last_payment_at, tariff_name, tariff_base_price
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            CLIENT_COLUMNS
        );
        let created = sqlx::query_as::<_, Client>(&sql)
            .bind(client.agent_id)
            .bind(client.telegram_id)
            .bind(&client.username)
            .bind(&client.subscription_link)
            .bind(client.expires_at)
            .bind(client.monthly_price)
            .bind(client.last_payment_amount)
            .bind(client.last_payment_at)
            .bind(&client.tariff_name)
            .bind(client.tariff_base_price)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(created)
    }

    async fn sync_client(
        &mut self,
        client_id: i64,
        expires_at: Option<OffsetDateTime>,
        subscription_link: Option<String>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE clients SET expires_at = $3, subscription_link = $4 WHERE id = $1 AND agent_id = $2",
        )
        .bind(client_id)
        .bind(self.agent.id)
        .bind(expires_at)
        .bind(subscription_link)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("client {}", client_id)));
        }
        Ok(())
    }

    async fn remove_client(&mut self, client_id: i64) -> StoreResult<Option<Client>> {
        let sql = format!(
            "DELETE FROM clients WHERE id = $1 AND agent_id = $2 RETURNING {}",
            CLIENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .bind(self.agent.id)
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    async fn apply_renewal(&mut self, update: RenewalUpdate) -> StoreResult<(Client, Renewal)> {
        let sql = format!(
            r#"
            UPDATE clients
            SET expires_at = $2,
                subscription_link = COALESCE($3, subscription_link),
                monthly_price = $4,
                last_payment_amount = $5,
                last_payment_at = $6,
                tariff_name = COALESCE($7, tariff_name),
                tariff_base_price = $8
            WHERE id = $1 AND agent_id = $9
            RETURNING {}
            "#,
            CLIENT_COLUMNS
        );
        let client = sqlx::query_as::<_, Client>(&sql)
            .bind(update.client_id)
            .bind(update.expires_at)
            .bind(&update.subscription_link)
            .bind(update.monthly_price)
            .bind(update.payment_amount)
            .bind(update.paid_at)
            .bind(&update.tariff_name)
            .bind(update.tariff_base_price)
            .bind(self.agent.id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("client {}", update.client_id)))?;

        let renewal = sqlx::query_as::<_, Renewal>(
            r#"
            INSERT INTO renewals (agent_id, client_id, days, debt_amount, payment_amount)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, agent_id, client_id, days, debt_amount, payment_amount, created_at
            "#,
        )
        .bind(self.agent.id)
        .bind(client.id)
        .bind(update.days)
        .bind(update.debt_amount)
        .bind(update.payment_amount)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok((client, renewal))
    }

    async fn adjust_debt(&mut self, delta: i64, reason: &str) -> StoreResult<DebtEvent> {
        let before = self.agent.current_debt;
        let after = before.saturating_add(delta).max(0);

        sqlx::query("UPDATE agents SET current_debt = $2 WHERE id = $1")
            .bind(self.agent.id)
            .bind(after)
            .execute(&mut *self.tx)
            .await?;

        let event = sqlx::query_as::<_, DebtEvent>(
            r#"
            INSERT INTO debt_events (agent_id, amount, reason)
            VALUES ($1, $2, $3)
            RETURNING id, agent_id, amount, reason, created_at
            "#,
        )
        .bind(self.agent.id)
        .bind(after - before)
        .bind(reason)
        .fetch_one(&mut *self.tx)
        .await?;

        self.agent.current_debt = after;
        Ok(event)
    }

    async fn decide_transfer(
        &mut self,
        request_id: i64,
        status: TransferStatus,
        decided_at: OffsetDateTime,
    ) -> StoreResult<Option<TransferRequest>> {
        let sql = format!(
            r#"
            UPDATE transfer_requests
            SET status = $3, decided_at = $4
            WHERE id = $1 AND agent_id = $2 AND status = 'pending'
            RETURNING {}
            "#,
            TRANSFER_COLUMNS
        );
        sqlx::query_as::<_, TransferRow>(&sql)
            .bind(request_id)
            .bind(self.agent.id)
            .bind(status.as_str())
            .bind(decided_at)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
