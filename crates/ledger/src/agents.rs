//! Principals and agent administration
//!
//! Every request starts by resolving the chat user into a [`Principal`].
//! Owner and admins always get an agent record; anyone else must have been
//! registered and be active.

use std::sync::Arc;

use resell_shared::{Agent, AgentOverview, Client, Config, NewAgent, Role};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::store::{DeletedAgent, Store};

/// The chat user behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub telegram_id: i64,
    pub name: String,
    pub username: Option<String>,
}

/// An authenticated actor with its role and agent record.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub role: Role,
    pub agent: Agent,
}

impl Principal {
    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }

    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// Owner and admins only.
    pub fn require_privileged(&self) -> LedgerResult<()> {
        if self.is_privileged() {
            Ok(())
        } else {
            Err(LedgerError::AccessDenied)
        }
    }
}

/// Totals over all agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_clients: i64,
    pub total_debt: i64,
    /// Sum of positive credit limits
    pub total_credit_limit: i64,
    pub unlimited_agents: usize,
}

impl ReportSummary {
    pub fn from_agents(agents: &[AgentOverview]) -> Self {
        agents
            .iter()
            .fold(ReportSummary::default(), |mut summary, overview| {
                let agent = &overview.agent;
                summary.total_agents += 1;
                if agent.is_active {
                    summary.active_agents += 1;
                }
                summary.total_clients += overview.client_count;
                summary.total_debt += agent.current_debt;
                if agent.credit_limit > 0 {
                    summary.total_credit_limit += agent.credit_limit;
                } else {
                    summary.unlimited_agents += 1;
                }
                summary
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub agents: Vec<AgentOverview>,
    pub summary: ReportSummary,
}

#[derive(Clone)]
pub struct AgentService {
    store: Arc<dyn Store>,
    config: Arc<Config>,
}

impl AgentService {
    pub fn new(store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    fn new_agent(&self, telegram_id: i64, name: &str, username: Option<&str>) -> NewAgent {
        NewAgent {
            telegram_id,
            name: name.trim().to_string(),
            telegram_username: NewAgent::normalize_username(username),
            credit_limit: self.config.agent_defaults.credit_limit,
            owner_share_percent: self.config.agent_defaults.owner_share_percent,
        }
    }

    /// Resolve the actor's role and agent record.
    pub async fn authenticate(&self, actor: &Actor) -> LedgerResult<Principal> {
        let role = self.config.role_of(actor.telegram_id);
        let new = self.new_agent(actor.telegram_id, &actor.name, actor.username.as_deref());

        if role.is_privileged() {
            let agent = self.store.get_or_create_agent(new).await?;
            return Ok(Principal { role, agent });
        }

        let agent = match self.store.agent_by_telegram_id(actor.telegram_id).await? {
            Some(agent) => agent,
            None => {
                tracing::debug!(telegram_id = actor.telegram_id, "Unregistered user");
                return Err(LedgerError::AccessDenied);
            }
        };
        if !agent.is_active {
            return Err(LedgerError::AgentInactive);
        }

        // Refresh a changed username
        let agent = if new.telegram_username.is_some()
            && new.telegram_username != agent.telegram_username
        {
            self.store.get_or_create_agent(new).await?
        } else {
            agent
        };

        Ok(Principal { role, agent })
    }

    pub async fn register(
        &self,
        principal: &Principal,
        telegram_id: i64,
        name: &str,
        username: Option<&str>,
    ) -> LedgerResult<Agent> {
        principal.require_privileged()?;
        let name = if name.trim().is_empty() {
            telegram_id.to_string()
        } else {
            name.to_string()
        };

        let agent = self
            .store
            .get_or_create_agent(self.new_agent(telegram_id, &name, username))
            .await?;
        tracing::info!(
            agent_id = agent.id,
            telegram_id,
            registered_by = principal.agent.telegram_id,
            "Agent registered"
        );
        Ok(agent)
    }

    /// Set the credit limit. Zero means unlimited.
    pub async fn set_credit_limit(
        &self,
        principal: &Principal,
        agent_id: i64,
        credit_limit: i64,
    ) -> LedgerResult<Agent> {
        principal.require_privileged()?;
        if credit_limit < 0 {
            return Err(ValidationError::NegativeLimit.into());
        }

        let agent = self
            .store
            .set_credit_limit(agent_id, credit_limit)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("agent {}", agent_id)))?;
        tracing::info!(
            agent_id,
            credit_limit,
            current_debt = agent.current_debt,
            "Credit limit updated"
        );
        Ok(agent)
    }

    pub async fn set_active(
        &self,
        principal: &Principal,
        agent_id: i64,
        is_active: bool,
    ) -> LedgerResult<Agent> {
        principal.require_privileged()?;
        let agent = self
            .store
            .set_agent_active(agent_id, is_active)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("agent {}", agent_id)))?;
        tracing::info!(agent_id, is_active, "Agent activity changed");
        Ok(agent)
    }

    pub async fn report(&self, principal: &Principal) -> LedgerResult<AgentReport> {
        principal.require_privileged()?;
        let agents = self.store.list_agents().await?;
        let summary = ReportSummary::from_agents(&agents);
        Ok(AgentReport { agents, summary })
    }

    /// Remove an agent with its clients and history.
    pub async fn delete_agent(
        &self,
        principal: &Principal,
        agent_id: i64,
    ) -> LedgerResult<DeletedAgent> {
        principal.require_privileged()?;
        let deleted = self
            .store
            .delete_agent(agent_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("agent {}", agent_id)))?;
        tracing::warn!(
            agent_id,
            telegram_id = deleted.agent.telegram_id,
            clients_removed = deleted.clients_removed,
            "Agent deleted"
        );
        Ok(deleted)
    }

    /// Forget a subscription locally. The gateway is not touched.
    pub async fn delete_client(&self, principal: &Principal, client_id: i64) -> LedgerResult<Client> {
        principal.require_privileged()?;
        let client = self
            .store
            .delete_client(client_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("client {}", client_id)))?;
        tracing::info!(
            client_id,
            agent_id = client.agent_id,
            username = %client.username,
            "Client deleted"
        );
        Ok(client)
    }

    /// The principal's own clients.
    pub async fn clients_of(&self, principal: &Principal) -> LedgerResult<Vec<Client>> {
        Ok(self.store.list_clients(Some(principal.agent.id)).await?)
    }
}
