//! Debt ledger
//!
//! Balance changes only happen through [`increase`] and [`decrease`] inside
//! an [`AgentTx`], so the audit event and the balance move as one unit and
//! the limit check sees the same balance the increase is applied to.

use std::sync::Arc;

use resell_shared::{Agent, DebtEvent, Renewal};
use serde::Serialize;

use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::store::{AgentTx, Store};

/// Whether adding `add_amount` would push the agent over a positive credit limit.
pub fn credit_limit_exceeded(agent: &Agent, add_amount: i64) -> bool {
    if agent.credit_limit <= 0 {
        return false;
    }
    agent.current_debt.saturating_add(add_amount) > agent.credit_limit
}

/// [`credit_limit_exceeded`] as an error carrying the balance the caller saw.
pub fn ensure_within_limit(agent: &Agent, add_amount: i64) -> LedgerResult<()> {
    if credit_limit_exceeded(agent, add_amount) {
        tracing::info!(
            agent_id = agent.id,
            current_debt = agent.current_debt,
            credit_limit = agent.credit_limit,
            add_amount,
            "Credit limit would be exceeded"
        );
        return Err(LedgerError::CreditLimitExceeded {
            current_debt: agent.current_debt,
            credit_limit: agent.credit_limit,
        });
    }
    Ok(())
}

/// Add `amount` to the locked agent's debt. Zero amounts record nothing.
pub async fn increase(
    tx: &mut dyn AgentTx,
    amount: i64,
    reason: &str,
) -> LedgerResult<Option<DebtEvent>> {
    if amount < 0 {
        return Err(ValidationError::NonPositiveAmount.into());
    }
    if amount == 0 {
        return Ok(None);
    }

    let event = tx.adjust_debt(amount, reason).await?;
    tracing::info!(
        agent_id = event.agent_id,
        amount,
        current_debt = tx.agent().current_debt,
        reason,
        "Debt increased"
    );
    Ok(Some(event))
}

/// Subtract `amount` from the locked agent's debt, never going below zero.
pub async fn decrease(tx: &mut dyn AgentTx, amount: i64, reason: &str) -> LedgerResult<DebtEvent> {
    if amount <= 0 {
        return Err(ValidationError::NonPositiveAmount.into());
    }

    let event = tx.adjust_debt(-amount, reason).await?;
    tracing::info!(
        agent_id = event.agent_id,
        requested = amount,
        applied = event.amount,
        current_debt = tx.agent().current_debt,
        reason,
        "Debt decreased"
    );
    Ok(event)
}

/// An agent's balance with the history that explains it.
#[derive(Debug, Clone, Serialize)]
pub struct Statement {
    pub agent: Agent,
    pub events: Vec<DebtEvent>,
    pub renewals: Vec<Renewal>,
    /// Sum of event amounts equals the current debt
    pub consistent: bool,
}

/// Read side of the ledger plus standalone charges.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn Store>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn statement(&self, agent_id: i64) -> LedgerResult<Statement> {
        let agent = self
            .store
            .agent_by_id(agent_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("agent {}", agent_id)))?;
        let events = self.store.debt_events(agent_id).await?;
        let renewals = self.store.renewals(agent_id).await?;

        let total: i64 = events.iter().map(|e| e.amount).sum();
        let consistent = total == agent.current_debt;
        if !consistent {
            tracing::error!(
                agent_id,
                current_debt = agent.current_debt,
                event_total = total,
                "Debt does not match audit trail"
            );
        }

        Ok(Statement {
            agent,
            events,
            renewals,
            consistent,
        })
    }

    /// Limit-checked increase in its own transaction.
    #[cfg(test)]
    pub(crate) async fn charge(&self, agent_id: i64, amount: i64, reason: &str) -> LedgerResult<Agent> {
        let mut tx = self.store.begin_agent(agent_id).await?;
        ensure_within_limit(tx.agent(), amount)?;
        increase(&mut *tx, amount, reason).await?;
        let agent = tx.agent().clone();
        tx.commit().await?;
        Ok(agent)
    }
}
