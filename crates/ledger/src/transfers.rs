//! Debt repayment requests
//!
//! An agent claims it transferred money; the owner approves or rejects the
//! claim exactly once. Approval decreases the agent's debt in the same
//! transaction that records the decision.

use std::sync::Arc;

use resell_shared::{Agent, DebtEvent, TransferRequest, TransferStatus};
use serde::Serialize;
use time::OffsetDateTime;

use crate::agents::Principal;
use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::ledger;
use crate::store::Store;

/// Result of an owner decision.
#[derive(Debug, Clone, Serialize)]
pub struct TransferDecision {
    pub request: TransferRequest,
    /// The agent after the decision
    pub agent: Agent,
    /// Present for approvals
    pub debt_event: Option<DebtEvent>,
}

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn Store>,
}

impl TransferService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// File a repayment claim for the principal's own agent.
    pub async fn request(&self, principal: &Principal, amount: i64) -> LedgerResult<TransferRequest> {
        if amount <= 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        if !principal.agent.is_active {
            return Err(LedgerError::AgentInactive);
        }

        let request = self
            .store
            .create_transfer(principal.agent.id, amount)
            .await?;
        tracing::info!(
            request_id = request.id,
            agent_id = request.agent_id,
            amount,
            "Transfer requested"
        );
        Ok(request)
    }

    /// Requests still waiting for the owner, oldest first.
    pub async fn pending(&self, principal: &Principal) -> LedgerResult<Vec<TransferRequest>> {
        if !principal.is_owner() {
            return Err(LedgerError::AccessDenied);
        }
        Ok(self.store.pending_transfers().await?)
    }

    pub async fn approve(
        &self,
        principal: &Principal,
        request_id: i64,
    ) -> LedgerResult<TransferDecision> {
        self.decide(principal, request_id, TransferStatus::Approved)
            .await
    }

    pub async fn reject(
        &self,
        principal: &Principal,
        request_id: i64,
    ) -> LedgerResult<TransferDecision> {
        self.decide(principal, request_id, TransferStatus::Rejected)
            .await
    }

    async fn decide(
        &self,
        principal: &Principal,
        request_id: i64,
        status: TransferStatus,
    ) -> LedgerResult<TransferDecision> {
        if !principal.is_owner() {
            return Err(LedgerError::AccessDenied);
        }

        let request = self
            .store
            .transfer_by_id(request_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transfer request {}", request_id)))?;
        if request.status != TransferStatus::Pending {
            return Err(LedgerError::AlreadyProcessed { request_id });
        }

        let mut tx = self.store.begin_agent(request.agent_id).await?;
        // Re-checked under the agent lock; a racing decision loses here
        let decided = tx
            .decide_transfer(request_id, status, OffsetDateTime::now_utc())
            .await?
            .ok_or(LedgerError::AlreadyProcessed { request_id })?;

        let debt_event = match status {
            TransferStatus::Approved => Some(
                ledger::decrease(
                    &mut *tx,
                    decided.amount,
                    &format!("transfer #{} approved", request_id),
                )
                .await?,
            ),
            _ => None,
        };
        let agent = tx.agent().clone();
        tx.commit().await?;

        tracing::info!(
            request_id,
            agent_id = agent.id,
            status = %decided.status,
            current_debt = agent.current_debt,
            "Transfer decided"
        );
        Ok(TransferDecision {
            request: decided,
            agent,
            debt_event,
        })
    }
}
