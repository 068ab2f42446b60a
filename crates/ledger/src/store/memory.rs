//! In-memory store for tests and local development
//!
//! Per-agent serialization uses one async mutex per agent. Transactions stage
//! their writes and apply them under the state lock on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use resell_shared::{
    Agent, AgentOverview, Client, DebtEvent, NewAgent, NewClient, Renewal, RenewalUpdate,
    TransferRequest, TransferStatus,
};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{AgentTx, DeletedAgent, Store, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    agents: BTreeMap<i64, Agent>,
    clients: BTreeMap<i64, Client>,
    debt_events: Vec<DebtEvent>,
    renewals: Vec<Renewal>,
    transfers: BTreeMap<i64, TransferRequest>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Store backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    agent_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn agent_lock(&self, agent_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().await;
        locks.entry(agent_id).or_default().clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_agent(&self, new: NewAgent) -> StoreResult<Agent> {
        let mut state = self.state.lock().await;

        if let Some(agent) = state
            .agents
            .values_mut()
            .find(|a| a.telegram_id == new.telegram_id)
        {
            if new.telegram_username.is_some() && agent.telegram_username != new.telegram_username
            {
                agent.telegram_username = new.telegram_username;
            }
            return Ok(agent.clone());
        }

        let id = state.next_id();
        let agent = Agent {
            id,
            telegram_id: new.telegram_id,
            name: new.name,
            telegram_username: new.telegram_username,
            is_active: true,
            credit_limit: new.credit_limit,
            current_debt: 0,
            owner_share_percent: new.owner_share_percent,
            created_at: OffsetDateTime::now_utc(),
        };
        state.agents.insert(id, agent.clone());
        Ok(agent)
    }

    async fn agent_by_id(&self, agent_id: i64) -> StoreResult<Option<Agent>> {
        Ok(self.state.lock().await.agents.get(&agent_id).cloned())
    }

    async fn agent_by_telegram_id(&self, telegram_id: i64) -> StoreResult<Option<Agent>> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .values()
            .find(|a| a.telegram_id == telegram_id)
            .cloned())
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentOverview>> {
        let state = self.state.lock().await;
        let mut agents: Vec<AgentOverview> = state
            .agents
            .values()
            .map(|agent| AgentOverview {
                agent: agent.clone(),
                client_count: state
                    .clients
                    .values()
                    .filter(|c| c.agent_id == agent.id)
                    .count() as i64,
            })
            .collect();
        agents.sort_by_key(|o| (o.agent.created_at, o.agent.id));
        Ok(agents)
    }

    async fn set_credit_limit(
        &self,
        agent_id: i64,
        credit_limit: i64,
    ) -> StoreResult<Option<Agent>> {
        let mut state = self.state.lock().await;
        Ok(state.agents.get_mut(&agent_id).map(|agent| {
            agent.credit_limit = credit_limit;
            agent.clone()
        }))
    }

    async fn set_agent_active(&self, agent_id: i64, is_active: bool) -> StoreResult<Option<Agent>> {
        let mut state = self.state.lock().await;
        Ok(state.agents.get_mut(&agent_id).map(|agent| {
            agent.is_active = is_active;
            agent.clone()
        }))
    }

    async fn delete_agent(&self, agent_id: i64) -> StoreResult<Option<DeletedAgent>> {
        let mut state = self.state.lock().await;
        let Some(agent) = state.agents.remove(&agent_id) else {
            return Ok(None);
        };

        let before = state.clients.len();
        state.clients.retain(|_, c| c.agent_id != agent_id);
        let clients_removed = (before - state.clients.len()) as u64;
        state.debt_events.retain(|e| e.agent_id != agent_id);
        state.renewals.retain(|r| r.agent_id != agent_id);
        state.transfers.retain(|_, t| t.agent_id != agent_id);

        Ok(Some(DeletedAgent {
            agent,
            clients_removed,
        }))
    }

    async fn debt_events(&self, agent_id: i64) -> StoreResult<Vec<DebtEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .debt_events
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn renewals(&self, agent_id: i64) -> StoreResult<Vec<Renewal>> {
        let state = self.state.lock().await;
        Ok(state
            .renewals
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn client_by_id(&self, client_id: i64) -> StoreResult<Option<Client>> {
        Ok(self.state.lock().await.clients.get(&client_id).cloned())
    }

    async fn client_by_username(
        &self,
        agent_id: i64,
        username: &str,
    ) -> StoreResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .find(|c| c.agent_id == agent_id && c.username == username)
            .cloned())
    }

    async fn list_clients(&self, agent_id: Option<i64>) -> StoreResult<Vec<Client>> {
        let state = self.state.lock().await;
        Ok(state
            .clients
            .values()
            .filter(|c| agent_id.map_or(true, |id| c.agent_id == id))
            .cloned()
            .collect())
    }

    async fn delete_client(&self, client_id: i64) -> StoreResult<Option<Client>> {
        let mut state = self.state.lock().await;
        let removed = state.clients.remove(&client_id);
        if removed.is_some() {
            state.renewals.retain(|r| r.client_id != client_id);
        }
        Ok(removed)
    }

    async fn expiring_clients(
        &self,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> StoreResult<Vec<(Client, Agent)>> {
        let state = self.state.lock().await;
        let mut rows: Vec<(Client, Agent)> = state
            .clients
            .values()
            .filter(|c| match c.expires_at {
                Some(expires_at) => {
                    expires_at > from
                        && expires_at <= until
                        && c.expires_notified_for != Some(expires_at)
                }
                None => false,
            })
            .filter_map(|c| {
                state
                    .agents
                    .get(&c.agent_id)
                    .map(|a| (c.clone(), a.clone()))
            })
            .collect();
        rows.sort_by(|(a, _), (b, _)| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.username.cmp(&b.username))
        });
        Ok(rows)
    }

    async fn mark_expiry_notified(
        &self,
        client_id: i64,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(client) = state.clients.get_mut(&client_id) {
            client.expires_notified_for = Some(expires_at);
        }
        Ok(())
    }

    async fn create_transfer(&self, agent_id: i64, amount: i64) -> StoreResult<TransferRequest> {
        let mut state = self.state.lock().await;
        if !state.agents.contains_key(&agent_id) {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }
        let id = state.next_id();
        let request = TransferRequest {
            id,
            agent_id,
            amount,
            status: TransferStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            decided_at: None,
        };
        state.transfers.insert(id, request.clone());
        Ok(request)
    }

    async fn transfer_by_id(&self, request_id: i64) -> StoreResult<Option<TransferRequest>> {
        Ok(self.state.lock().await.transfers.get(&request_id).cloned())
    }

    async fn pending_transfers(&self) -> StoreResult<Vec<TransferRequest>> {
        let state = self.state.lock().await;
        let mut pending: Vec<TransferRequest> = state
            .transfers
            .values()
            .filter(|t| t.status == TransferStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| (t.created_at, t.id));
        Ok(pending)
    }

    async fn begin_agent(&self, agent_id: i64) -> StoreResult<Box<dyn AgentTx>> {
        let guard = self.agent_lock(agent_id).await.lock_owned().await;
        let agent = self
            .state
            .lock()
            .await
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {}", agent_id)))?;

        Ok(Box::new(MemoryAgentTx {
            state: self.state.clone(),
            _guard: guard,
            agent,
            staged: Vec::new(),
        }))
    }
}

enum Staged {
    Client(Client),
    Renewal { client: Client, renewal: Renewal },
    Debt(DebtEvent),
    Transfer(TransferRequest),
    Removed(i64),
}

struct MemoryAgentTx {
    state: Arc<Mutex<MemoryState>>,
    _guard: OwnedMutexGuard<()>,
    agent: Agent,
    staged: Vec<Staged>,
}

impl MemoryAgentTx {
    /// Latest version of a client of this agent, staged writes first.
    fn current_client(&self, state: &MemoryState, client_id: i64) -> Option<Client> {
        let staged = self.staged.iter().rev().find_map(|write| match write {
            Staged::Client(c) | Staged::Renewal { client: c, .. } if c.id == client_id => {
                Some(Some(c))
            }
            Staged::Removed(id) if *id == client_id => Some(None),
            _ => None,
        });
        let client = match staged {
            Some(client) => client.cloned(),
            None => state.clients.get(&client_id).cloned(),
        };
        client.filter(|c| c.agent_id == self.agent.id)
    }
}

#[async_trait]
impl AgentTx for MemoryAgentTx {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    async fn client(&mut self, client_id: i64) -> StoreResult<Option<Client>> {
        let state = self.state.lock().await;
        Ok(self.current_client(&state, client_id))
    }

    async fn insert_client(&mut self, client: NewClient) -> StoreResult<Client> {
        let mut state = self.state.lock().await;

        let taken = state
            .clients
            .values()
            .any(|c| c.agent_id == client.agent_id && c.username == client.username)
            || self.staged.iter().any(|write| {
                matches!(write, Staged::Client(c) if c.username == client.username)
            });
        if taken {
            return Err(StoreError::Conflict(format!("client {}", client.username)));
        }

        let created = Client {
            id: state.next_id(),
            agent_id: client.agent_id,
            telegram_id: client.telegram_id,
            username: client.username,
            subscription_link: client.subscription_link,
            expires_at: client.expires_at,
            monthly_price: client.monthly_price,
            last_payment_amount: client.last_payment_amount,
            last_payment_at: client.last_payment_at,
            tariff_name: client.tariff_name,
            tariff_base_price: client.tariff_base_price,
            expires_notified_for: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.staged.push(Staged::Client(created.clone()));
        Ok(created)
    }

    async fn sync_client(
        &mut self,
        client_id: i64,
        expires_at: Option<OffsetDateTime>,
        subscription_link: Option<String>,
    ) -> StoreResult<()> {
        let state = self.state.lock().await;
        let mut client = self
            .current_client(&state, client_id)
            .ok_or_else(|| StoreError::NotFound(format!("client {}", client_id)))?;
        drop(state);

        client.expires_at = expires_at;
        client.subscription_link = subscription_link;
        self.staged.push(Staged::Client(client));
        Ok(())
    }

    async fn remove_client(&mut self, client_id: i64) -> StoreResult<Option<Client>> {
        let state = self.state.lock().await;
        let removed = self.current_client(&state, client_id);
        drop(state);

        if removed.is_some() {
            self.staged.push(Staged::Removed(client_id));
        }
        Ok(removed)
    }

    async fn apply_renewal(&mut self, update: RenewalUpdate) -> StoreResult<(Client, Renewal)> {
        let mut state = self.state.lock().await;

        let mut client = self
            .current_client(&state, update.client_id)
            .ok_or_else(|| StoreError::NotFound(format!("client {}", update.client_id)))?;

        client.expires_at = Some(update.expires_at);
        if update.subscription_link.is_some() {
            client.subscription_link = update.subscription_link;
        }
        client.monthly_price = update.monthly_price;
        client.last_payment_amount = Some(update.payment_amount);
        client.last_payment_at = Some(update.paid_at);
        if update.tariff_name.is_some() {
            client.tariff_name = update.tariff_name;
        }
        client.tariff_base_price = Some(update.tariff_base_price);

        let renewal = Renewal {
            id: state.next_id(),
            agent_id: self.agent.id,
            client_id: client.id,
            days: update.days,
            debt_amount: update.debt_amount,
            payment_amount: update.payment_amount,
            created_at: OffsetDateTime::now_utc(),
        };

        self.staged.push(Staged::Renewal {
            client: client.clone(),
            renewal: renewal.clone(),
        });
        Ok((client, renewal))
    }

    async fn adjust_debt(&mut self, delta: i64, reason: &str) -> StoreResult<DebtEvent> {
        let mut state = self.state.lock().await;

        let before = self.agent.current_debt;
        let after = before.saturating_add(delta).max(0);
        let event = DebtEvent {
            id: state.next_id(),
            agent_id: self.agent.id,
            amount: after - before,
            reason: reason.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };

        self.agent.current_debt = after;
        self.staged.push(Staged::Debt(event.clone()));
        Ok(event)
    }

    async fn decide_transfer(
        &mut self,
        request_id: i64,
        status: TransferStatus,
        decided_at: OffsetDateTime,
    ) -> StoreResult<Option<TransferRequest>> {
        let state = self.state.lock().await;

        let request = state
            .transfers
            .get(&request_id)
            .filter(|t| t.agent_id == self.agent.id)
            .ok_or_else(|| StoreError::NotFound(format!("transfer request {}", request_id)))?;

        let already_staged = self
            .staged
            .iter()
            .any(|write| matches!(write, Staged::Transfer(t) if t.id == request_id));
        if request.status != TransferStatus::Pending || already_staged {
            return Ok(None);
        }

        let mut decided = request.clone();
        decided.status = status;
        decided.decided_at = Some(decided_at);
        self.staged.push(Staged::Transfer(decided.clone()));
        Ok(Some(decided))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        let mut state = this.state.lock().await;

        let agent_id = this.agent.id;
        if !state.agents.contains_key(&agent_id) {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }

        for write in this.staged {
            match write {
                Staged::Client(client) => {
                    state.clients.insert(client.id, client);
                }
                Staged::Renewal { client, renewal } => {
                    state.clients.insert(client.id, client);
                    state.renewals.push(renewal);
                }
                Staged::Debt(event) => state.debt_events.push(event),
                Staged::Transfer(request) => {
                    state.transfers.insert(request.id, request);
                }
                Staged::Removed(client_id) => {
                    state.clients.remove(&client_id);
                    state.renewals.retain(|r| r.client_id != client_id);
                }
            }
        }

        if let Some(agent) = state.agents.get_mut(&agent_id) {
            agent.current_debt = this.agent.current_debt;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_agent(telegram_id: i64) -> NewAgent {
        NewAgent {
            telegram_id,
            name: format!("agent {}", telegram_id),
            telegram_username: None,
            credit_limit: 0,
            owner_share_percent: 100,
        }
    }

    fn new_client(agent_id: i64, username: &str) -> NewClient {
        NewClient {
            agent_id,
            telegram_id: None,
            username: username.to_string(),
            subscription_link: None,
            expires_at: None,
            monthly_price: 300,
            last_payment_amount: None,
            last_payment_at: None,
            tariff_name: None,
            tariff_base_price: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent_and_refreshes_username() {
        let store = MemoryStore::new();
        let first = store.get_or_create_agent(new_agent(42)).await.unwrap();

        let mut again = new_agent(42);
        again.telegram_username = Some("ivan".to_string());
        let second = store.get_or_create_agent(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.telegram_username.as_deref(), Some("ivan"));
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_nothing_behind() {
        let store = MemoryStore::new();
        let agent = store.get_or_create_agent(new_agent(1)).await.unwrap();

        {
            let mut tx = store.begin_agent(agent.id).await.unwrap();
            tx.insert_client(new_client(agent.id, "ivan_01")).await.unwrap();
            tx.adjust_debt(200, "test").await.unwrap();
            assert_eq!(tx.agent().current_debt, 200);
        }

        let agent = store.agent_by_id(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.current_debt, 0);
        assert!(store.debt_events(agent.id).await.unwrap().is_empty());
        assert!(store.list_clients(Some(agent.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_applies_debt_and_events_together() {
        let store = MemoryStore::new();
        let agent = store.get_or_create_agent(new_agent(1)).await.unwrap();

        let mut tx = store.begin_agent(agent.id).await.unwrap();
        tx.adjust_debt(300, "charge").await.unwrap();
        let refund = tx.adjust_debt(-500, "repayment").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(refund.amount, -300);
        let agent = store.agent_by_id(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.current_debt, 0);
        let sum: i64 = store
            .debt_events(agent.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(sum, agent.current_debt);
    }

    #[tokio::test]
    async fn test_duplicate_username_within_agent_conflicts() {
        let store = MemoryStore::new();
        let agent = store.get_or_create_agent(new_agent(1)).await.unwrap();

        let mut tx = store.begin_agent(agent.id).await.unwrap();
        tx.insert_client(new_client(agent.id, "ivan_01")).await.unwrap();
        let err = tx
            .insert_client(new_client(agent.id, "ivan_01"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_agent_cascades() {
        let store = MemoryStore::new();
        let agent = store.get_or_create_agent(new_agent(1)).await.unwrap();
        let other = store.get_or_create_agent(new_agent(2)).await.unwrap();

        let mut tx = store.begin_agent(agent.id).await.unwrap();
        tx.insert_client(new_client(agent.id, "a_client")).await.unwrap();
        tx.insert_client(new_client(agent.id, "b_client")).await.unwrap();
        tx.adjust_debt(100, "charge").await.unwrap();
        tx.commit().await.unwrap();
        store.create_transfer(agent.id, 50).await.unwrap();

        let mut tx = store.begin_agent(other.id).await.unwrap();
        tx.insert_client(new_client(other.id, "c_client")).await.unwrap();
        tx.commit().await.unwrap();

        let deleted = store.delete_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(deleted.clients_removed, 2);
        assert!(store.agent_by_id(agent.id).await.unwrap().is_none());
        assert!(store.debt_events(agent.id).await.unwrap().is_empty());
        assert_eq!(store.list_clients(None).await.unwrap().len(), 1);
        assert!(store.delete_agent(agent.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transfer_decided_once() {
        let store = MemoryStore::new();
        let agent = store.get_or_create_agent(new_agent(1)).await.unwrap();
        let request = store.create_transfer(agent.id, 50).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let mut tx = store.begin_agent(agent.id).await.unwrap();
        let first = tx
            .decide_transfer(request.id, TransferStatus::Approved, now)
            .await
            .unwrap();
        let second = tx
            .decide_transfer(request.id, TransferStatus::Rejected, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first.unwrap().status, TransferStatus::Approved);
        assert!(second.is_none());

        let mut tx = store.begin_agent(agent.id).await.unwrap();
        let third = tx
            .decide_transfer(request.id, TransferStatus::Rejected, now)
            .await
            .unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn test_sync_and_remove_apply_only_on_commit() {
        let store = MemoryStore::new();
        let agent = store.get_or_create_agent(new_agent(1)).await.unwrap();
        let other = store.get_or_create_agent(new_agent(2)).await.unwrap();

        let mut tx = store.begin_agent(agent.id).await.unwrap();
        let kept = tx.insert_client(new_client(agent.id, "kept_1")).await.unwrap();
        let gone = tx.insert_client(new_client(agent.id, "gone_1")).await.unwrap();
        tx.commit().await.unwrap();

        let link = Some("https://new/kept_1".to_string());
        {
            let mut tx = store.begin_agent(agent.id).await.unwrap();
            tx.sync_client(kept.id, None, link.clone()).await.unwrap();
            assert!(tx.remove_client(gone.id).await.unwrap().is_some());
            assert!(tx.client(gone.id).await.unwrap().is_none());
        }
        assert!(store.client_by_id(gone.id).await.unwrap().is_some());

        let mut tx = store.begin_agent(agent.id).await.unwrap();
        tx.sync_client(kept.id, None, link.clone()).await.unwrap();
        tx.remove_client(gone.id).await.unwrap();
        tx.commit().await.unwrap();

        let synced = store.client_by_id(kept.id).await.unwrap().unwrap();
        assert_eq!(synced.subscription_link, link);
        assert!(store.client_by_id(gone.id).await.unwrap().is_none());

        // Another agent's transaction does not see these clients
        let mut tx = store.begin_agent(other.id).await.unwrap();
        assert!(tx.client(kept.id).await.unwrap().is_none());
        assert!(matches!(
            tx.sync_client(kept.id, None, None).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
