//! Storage seam for agents, clients and the debt ledger
//!
//! [`Store`] covers plain reads and administrative writes. Everything that
//! touches an agent's debt goes through an [`AgentTx`]: a transaction that
//! holds the agent exclusively from the limit check until commit, so two
//! flows for the same agent can never both pass a check against a stale
//! balance. Dropping an [`AgentTx`] without calling `commit` discards every
//! write made through it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use resell_shared::{
    Agent, AgentOverview, Client, DebtEvent, NewAgent, NewClient, Renewal, RenewalUpdate,
    TransferRequest, TransferStatus,
};
use thiserror::Error;
use time::OffsetDateTime;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An agent removed together with everything it owned.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeletedAgent {
    pub agent: Agent,
    pub clients_removed: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Agents

    /// Insert the agent, or refresh its username if it already exists.
    async fn get_or_create_agent(&self, new: NewAgent) -> StoreResult<Agent>;
    async fn agent_by_id(&self, agent_id: i64) -> StoreResult<Option<Agent>>;
    async fn agent_by_telegram_id(&self, telegram_id: i64) -> StoreResult<Option<Agent>>;
    /// All agents with client counts, oldest first.
    async fn list_agents(&self) -> StoreResult<Vec<AgentOverview>>;
    async fn set_credit_limit(&self, agent_id: i64, credit_limit: i64)
        -> StoreResult<Option<Agent>>;
    async fn set_agent_active(&self, agent_id: i64, is_active: bool)
        -> StoreResult<Option<Agent>>;
    /// Cascading removal of the agent, its clients and its history.
    async fn delete_agent(&self, agent_id: i64) -> StoreResult<Option<DeletedAgent>>;
    async fn debt_events(&self, agent_id: i64) -> StoreResult<Vec<DebtEvent>>;
    async fn renewals(&self, agent_id: i64) -> StoreResult<Vec<Renewal>>;

    // Clients

    async fn client_by_id(&self, client_id: i64) -> StoreResult<Option<Client>>;
    async fn client_by_username(&self, agent_id: i64, username: &str)
        -> StoreResult<Option<Client>>;
    /// Clients of one agent, or of every agent when `agent_id` is `None`.
    async fn list_clients(&self, agent_id: Option<i64>) -> StoreResult<Vec<Client>>;
    async fn delete_client(&self, client_id: i64) -> StoreResult<Option<Client>>;
    /// Clients expiring in `(from, until]` not yet notified for their current expiry.
    async fn expiring_clients(
        &self,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> StoreResult<Vec<(Client, Agent)>>;
    async fn mark_expiry_notified(&self, client_id: i64, expires_at: OffsetDateTime)
        -> StoreResult<()>;

    // Transfers

    async fn create_transfer(&self, agent_id: i64, amount: i64) -> StoreResult<TransferRequest>;
    async fn transfer_by_id(&self, request_id: i64) -> StoreResult<Option<TransferRequest>>;
    /// Undecided requests of every agent, oldest first.
    async fn pending_transfers(&self) -> StoreResult<Vec<TransferRequest>>;

    // Agent-scoped transactions

    /// Lock the agent for the lifetime of the returned transaction.
    async fn begin_agent(&self, agent_id: i64) -> StoreResult<Box<dyn AgentTx>>;
}

/// Writes made while holding one agent exclusively.
#[async_trait]
pub trait AgentTx: Send {
    /// The locked agent as of the last write in this transaction.
    fn agent(&self) -> &Agent;

    /// A client of this agent, including writes staged in this transaction.
    async fn client(&mut self, client_id: i64) -> StoreResult<Option<Client>>;

    async fn insert_client(&mut self, client: NewClient) -> StoreResult<Client>;

    /// Overwrite expiry and link with the gateway's values.
    async fn sync_client(
        &mut self,
        client_id: i64,
        expires_at: Option<OffsetDateTime>,
        subscription_link: Option<String>,
    ) -> StoreResult<()>;

    /// Remove a client of this agent together with its renewals.
    async fn remove_client(&mut self, client_id: i64) -> StoreResult<Option<Client>>;

    /// Overwrite the client after an extension and append the renewal row.
    async fn apply_renewal(&mut self, update: RenewalUpdate) -> StoreResult<(Client, Renewal)>;

    /// Add `delta` to the debt, floored at zero, and append the matching
    /// event. The event records the change actually applied.
    async fn adjust_debt(&mut self, delta: i64, reason: &str) -> StoreResult<DebtEvent>;

    /// Move a pending request of this agent to `status`. `None` if it was
    /// no longer pending.
    async fn decide_transfer(
        &mut self,
        request_id: i64,
        status: TransferStatus,
        decided_at: OffsetDateTime,
    ) -> StoreResult<Option<TransferRequest>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
