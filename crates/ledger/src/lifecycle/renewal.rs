//! Renewal commit
//!
//! Same ordering as creation: limit check, gateway extend (or create when
//! the gateway lost the user), local overwrite plus history row, then debt.

use resell_shared::RenewalUpdate;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::creation::unrecorded;
use super::{check_days, ensure_active, ChosenTariff, LifecycleEngine, RenewTarget, RenewalReceipt};
use crate::agents::Principal;
use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::gateway::{extended_expiry, CreateUser, ExtendUser, ProvisioningOptions};
use crate::ledger;
use crate::pricing::{self, RenewalQuote, RenewalTerms};

/// Everything collected by the renewal dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalDraft {
    pub target: RenewTarget,
    pub days: i64,
    pub tariff: ChosenTariff,
    pub monthly_price: i64,
}

impl LifecycleEngine {
    pub async fn commit_renewal(
        &self,
        principal: &Principal,
        draft: RenewalDraft,
    ) -> LedgerResult<RenewalReceipt> {
        check_days(draft.days)?;
        if draft.monthly_price <= 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }

        // The charge goes to the client's agent, whoever renews
        let mut tx = self.store.begin_agent(draft.target.agent_id).await?;
        let agent = tx.agent().clone();
        if !principal.is_privileged() && agent.id != principal.agent.id {
            return Err(LedgerError::AccessDenied);
        }
        ensure_active(&agent)?;

        let client = self
            .store
            .client_by_id(draft.target.client_id)
            .await?
            .filter(|c| c.agent_id == agent.id)
            .ok_or_else(|| LedgerError::NotFound(format!("client {}", draft.target.client_id)))?;

        let now = OffsetDateTime::now_utc();
        let days_left = pricing::days_left(client.expires_at, now);
        let min_days_left = self.config.pricing.renew_min_days_left;
        if days_left > min_days_left {
            return Err(LedgerError::TooEarly {
                days_left,
                min_days_left,
            });
        }

        let quote = RenewalQuote::new(
            RenewalTerms {
                days: draft.days,
                days_left,
                old_base_price: client
                    .tariff_base_price
                    .filter(|p| *p > 0)
                    .unwrap_or(self.config.pricing.base_price),
                base_price: draft.tariff.base_price,
                old_monthly_price: client.monthly_price,
                monthly_price: draft.monthly_price,
            },
            self.period_days(),
        );
        ledger::ensure_within_limit(&agent, quote.owner_share)?;

        let provisioning = draft
            .tariff
            .id
            .and_then(|id| self.config.tariffs.find(id))
            .map(|t| t.provisioning.clone())
            .unwrap_or_default();
        let options = ProvisioningOptions::resolve(
            &provisioning,
            &self.config.gateway.defaults,
            agent.telegram_id,
            client.telegram_id,
        );

        let provisioned = match self.gateway.lookup_by_username(&client.username).await {
            Ok(Some(existing)) => {
                let expire_at = extended_expiry(existing.expire_at, now, draft.days)
                    .ok_or(ValidationError::TooManyDays)?;
                self.gateway
                    .extend(&ExtendUser {
                        uuid: existing.uuid,
                        expire_at,
                        options,
                    })
                    .await
                    .map(|user| (user, expire_at))
            }
            Ok(None) => {
                tracing::warn!(
                    username = %client.username,
                    "User missing in gateway during renewal, creating it"
                );
                let expire_at = now
                    .checked_add(Duration::days(draft.days))
                    .ok_or(ValidationError::TooManyDays)?;
                self.gateway
                    .create(&CreateUser {
                        username: client.username.clone(),
                        expire_at,
                        options,
                    })
                    .await
                    .map(|user| (user, expire_at))
            }
            Err(e) => Err(e),
        };
        let (user, requested_expiry) = provisioned.map_err(|e| {
            tracing::error!(
                agent_id = agent.id,
                username = %client.username,
                error = %e,
                "Gateway renewal failed"
            );
            LedgerError::from(e)
        })?;

        let (client, _renewal) = tx
            .apply_renewal(RenewalUpdate {
                client_id: client.id,
                days: draft.days,
                expires_at: user.expire_at.unwrap_or(requested_expiry),
                subscription_link: user.subscription_url,
                monthly_price: draft.monthly_price,
                payment_amount: quote.customer_total,
                paid_at: now,
                tariff_name: draft.tariff.name,
                tariff_base_price: draft.tariff.base_price,
                debt_amount: quote.owner_share,
            })
            .await
            .map_err(|e| unrecorded(&client.username, e.into()))?;

        let reason = format!("renewal {} days for {}", draft.days, client.username);
        ledger::increase(&mut *tx, quote.owner_share, &reason)
            .await
            .map_err(|e| unrecorded(&client.username, e))?;
        let current_debt = tx.agent().current_debt;
        tx.commit()
            .await
            .map_err(|e| unrecorded(&client.username, e.into()))?;

        tracing::info!(
            agent_id = agent.id,
            client_id = client.id,
            username = %client.username,
            days = draft.days,
            owner_share = quote.owner_share,
            upgrade_correction = quote.upgrade_correction,
            customer_total = quote.customer_total,
            current_debt,
            "Client renewed"
        );
        Ok(RenewalReceipt {
            client,
            quote,
            current_debt,
        })
    }
}
