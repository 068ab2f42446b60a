//! Client creation commit
//!
//! Runs under the agent's transaction: username checks, quote and limit
//! check, gateway create, then the local record and finally the debt.

use resell_shared::NewClient;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::{check_days, ensure_active, is_valid_username, ChosenTariff, CreationReceipt, LifecycleEngine};
use crate::agents::Principal;
use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::gateway::{CreateUser, ProvisioningOptions};
use crate::ledger;
use crate::pricing::CreationQuote;

/// Everything collected by the creation dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationDraft {
    pub username: String,
    pub days: i64,
    pub tariff: ChosenTariff,
    pub monthly_price: i64,
}

impl LifecycleEngine {
    pub async fn commit_creation(
        &self,
        principal: &Principal,
        draft: CreationDraft,
    ) -> LedgerResult<CreationReceipt> {
        if !is_valid_username(&draft.username) {
            return Err(ValidationError::InvalidUsername.into());
        }
        check_days(draft.days)?;
        if draft.monthly_price <= 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }

        let mut tx = self.store.begin_agent(principal.agent.id).await?;
        let agent = tx.agent().clone();
        ensure_active(&agent)?;

        // 1. Username is free locally and in the gateway
        if self
            .store
            .client_by_username(agent.id, &draft.username)
            .await?
            .is_some()
        {
            return Err(LedgerError::AlreadyExists(draft.username));
        }
        if self
            .gateway
            .lookup_by_username(&draft.username)
            .await?
            .is_some()
        {
            tracing::info!(username = %draft.username, "Username taken in gateway");
            return Err(LedgerError::AlreadyExists(draft.username));
        }

        // 2. Tariff parameters
        let provisioning = draft
            .tariff
            .id
            .and_then(|id| self.config.tariffs.find(id))
            .map(|t| t.provisioning.clone())
            .unwrap_or_default();

        // 3. Quote and limit check against the locked balance
        let quote = CreationQuote::new(
            draft.days,
            draft.tariff.base_price,
            draft.monthly_price,
            self.period_days(),
        );
        ledger::ensure_within_limit(&agent, quote.owner_share)?;

        // 4. External effect
        let now = OffsetDateTime::now_utc();
        let expire_at = now
            .checked_add(Duration::days(draft.days))
            .ok_or(ValidationError::TooManyDays)?;
        let request = CreateUser {
            username: draft.username.clone(),
            expire_at,
            options: ProvisioningOptions::resolve(
                &provisioning,
                &self.config.gateway.defaults,
                agent.telegram_id,
                None,
            ),
        };
        let user = self.gateway.create(&request).await.map_err(|e| {
            tracing::error!(
                agent_id = agent.id,
                username = %draft.username,
                error = %e,
                "Gateway create failed"
            );
            LedgerError::from(e)
        })?;

        // 5. Local record, then the debt
        let username = draft.username.clone();
        let client = tx
            .insert_client(NewClient {
                agent_id: agent.id,
                telegram_id: None,
                username: draft.username,
                subscription_link: user.subscription_url,
                expires_at: Some(user.expire_at.unwrap_or(request.expire_at)),
                monthly_price: draft.monthly_price,
                last_payment_amount: Some(quote.customer_total),
                last_payment_at: Some(now),
                tariff_name: draft.tariff.name,
                tariff_base_price: Some(draft.tariff.base_price),
            })
            .await
            .map_err(|e| unrecorded(&username, e.into()))?;

        let reason = format!("client {} created for {} days", username, draft.days);
        ledger::increase(&mut *tx, quote.owner_share, &reason)
            .await
            .map_err(|e| unrecorded(&username, e))?;
        let current_debt = tx.agent().current_debt;
        tx.commit()
            .await
            .map_err(|e| unrecorded(&username, e.into()))?;

        tracing::info!(
            agent_id = agent.id,
            client_id = client.id,
            username = %username,
            days = draft.days,
            owner_share = quote.owner_share,
            customer_total = quote.customer_total,
            current_debt,
            "Client created"
        );
        Ok(CreationReceipt {
            client,
            quote,
            current_debt,
        })
    }
}

/// The gateway already holds a subscription the local store failed to record.
pub(super) fn unrecorded(username: &str, error: LedgerError) -> LedgerError {
    tracing::error!(
        username,
        error = %error,
        "Provisioned in gateway but local commit failed; reconciliation will not adopt it"
    );
    error
}
