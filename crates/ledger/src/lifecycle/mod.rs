//! Lifecycle Workflow Engine
//!
//! The conversational state machine for creating and renewing client
//! subscriptions and for filing repayment claims.
//!
//! Creation: `awaiting_username -> awaiting_days -> awaiting_tariff (or
//! awaiting_price without tariffs) -> awaiting_price -> awaiting_confirmation`.
//!
//! Renewal: `awaiting_target -> awaiting_days -> awaiting_tariff (with the
//! "same tariff" shortcut) -> awaiting_price`, where a known previous price
//! lets the shortcut commit directly.
//!
//! Validation errors keep the session and prompt again. Every other error
//! clears the session.

mod creation;
mod registry;
mod renewal;
pub mod session;

use std::sync::Arc;

use resell_shared::{Agent, Client, Config, Tariff};
use time::OffsetDateTime;

use crate::agents::Principal;
use crate::error::{LedgerError, LedgerResult, ValidationError};
use crate::gateway::ProvisioningGateway;
use crate::ledger;
use crate::pricing::{self, CreationQuote};
use crate::store::Store;
use crate::transfers::TransferService;

pub use creation::CreationDraft;
pub use registry::SessionRegistry;
pub use renewal::RenewalDraft;
pub use session::{
    ChosenTariff, CreateState, CreationReceipt, Input, Outcome, Prompt, RenewState, RenewTarget,
    RenewalReceipt, Session, StepResult, DAY_OPTIONS, MAX_DAYS,
};

use session::parse_number;

enum Transition {
    /// Move to a state that needs more input
    Next(Session),
    /// The flow finished; the session resets
    Done(Outcome),
}

#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn Store>,
    gateway: Arc<dyn ProvisioningGateway>,
    config: Arc<Config>,
    transfers: TransferService,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn ProvisioningGateway>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            transfers: TransferService::new(store.clone()),
            store,
            gateway,
            config,
        }
    }

    fn period_days(&self) -> i64 {
        self.config.pricing.period_days
    }

    /// Apply one input to a session.
    pub async fn step(&self, principal: &Principal, session: Session, input: Input) -> StepResult {
        let input = input.normalize();
        tracing::debug!(
            telegram_id = principal.agent.telegram_id,
            ?input,
            "Dialogue step"
        );

        match self.transition(principal, session.clone(), input).await {
            Ok(Transition::Next(next)) => match self.prompt_for(principal, &next).await {
                Ok(Some(prompt)) => StepResult {
                    session: next,
                    outcome: Outcome::Prompt { prompt },
                },
                Ok(None) => menu(),
                Err(error) => failed(error),
            },
            Ok(Transition::Done(outcome)) => StepResult {
                session: Session::Idle,
                outcome,
            },
            Err(LedgerError::Validation(reason)) => {
                match self.prompt_for(principal, &session).await {
                    Ok(Some(prompt)) => StepResult {
                        session,
                        outcome: Outcome::Retry {
                            error: reason.into(),
                            prompt,
                        },
                    },
                    Ok(None) => menu(),
                    Err(error) => failed(error),
                }
            }
            Err(error) => failed(error),
        }
    }

    async fn transition(
        &self,
        principal: &Principal,
        session: Session,
        input: Input,
    ) -> LedgerResult<Transition> {
        match input {
            Input::Cancel | Input::Restart => return Ok(Transition::Done(Outcome::Menu)),
            Input::StartCreate => return self.start_create(principal),
            Input::StartRenew => return self.start_renew(principal),
            Input::StartPayDebt => {
                ensure_active(&principal.agent)?;
                return Ok(Transition::Next(Session::PayDebt));
            }
            _ => {}
        }

        match session {
            Session::Idle => Ok(Transition::Done(Outcome::Menu)),
            Session::Create(state) => self.create_step(principal, state, input).await,
            Session::Renew(state) => self.renew_step(principal, state, input).await,
            Session::PayDebt => self.pay_debt_step(principal, input).await,
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    fn creation_tariffs(&self, principal: &Principal) -> Vec<Tariff> {
        self.config
            .tariffs
            .visible_to(principal.agent.telegram_id, principal.is_privileged())
    }

    fn start_create(&self, principal: &Principal) -> LedgerResult<Transition> {
        ensure_active(&principal.agent)?;
        if self.creation_tariffs(principal).is_empty() {
            ledger::ensure_within_limit(&principal.agent, self.config.pricing.base_price)?;
        }
        Ok(Transition::Next(Session::Create(
            CreateState::AwaitingUsername,
        )))
    }

    async fn create_step(
        &self,
        principal: &Principal,
        state: CreateState,
        input: Input,
    ) -> LedgerResult<Transition> {
        let next = match (state, input) {
            (CreateState::AwaitingUsername, Input::Text { text }) => {
                let username = self.check_new_username(principal, &text).await?;
                CreateState::AwaitingDays { username }
            }

            (CreateState::AwaitingDays { .. }, Input::Back) => CreateState::AwaitingUsername,
            (CreateState::AwaitingDays { username }, input) => {
                let days = self.days_input(input, true)?;
                if self.creation_tariffs(principal).is_empty() {
                    CreateState::AwaitingPrice {
                        username,
                        days,
                        tariff: self.fallback_tariff(),
                    }
                } else {
                    CreateState::AwaitingTariff { username, days }
                }
            }

            (CreateState::AwaitingTariff { username, .. }, Input::Back) => {
                CreateState::AwaitingDays { username }
            }
            (CreateState::AwaitingTariff { username, days }, Input::PickTariff { tariff_id }) => {
                let tariff = find_tariff(&self.creation_tariffs(principal), tariff_id)?;
                ledger::ensure_within_limit(&principal.agent, tariff.base_price)?;
                CreateState::AwaitingPrice {
                    username,
                    days,
                    tariff,
                }
            }

            (CreateState::AwaitingPrice { username, days, .. }, Input::Back) => {
                if self.creation_tariffs(principal).is_empty() {
                    CreateState::AwaitingDays { username }
                } else {
                    CreateState::AwaitingTariff { username, days }
                }
            }
            (
                CreateState::AwaitingPrice {
                    username,
                    days,
                    tariff,
                },
                input,
            ) => CreateState::AwaitingConfirmation {
                monthly_price: price_input(input)?,
                username,
                days,
                tariff,
            },

            (
                CreateState::AwaitingConfirmation {
                    username,
                    days,
                    tariff,
                    ..
                },
                Input::Back,
            ) => CreateState::AwaitingPrice {
                username,
                days,
                tariff,
            },
            (
                CreateState::AwaitingConfirmation {
                    username,
                    days,
                    tariff,
                    monthly_price,
                },
                Input::Confirm,
            ) => {
                let draft = CreationDraft {
                    username,
                    days,
                    tariff,
                    monthly_price,
                };
                let receipt = self.commit_creation(principal, draft).await?;
                return Ok(Transition::Done(Outcome::ClientCreated { receipt }));
            }

            _ => return Err(ValidationError::UseButtons.into()),
        };
        Ok(Transition::Next(Session::Create(next)))
    }

    /// Format check, then this agent's records, then the gateway.
    async fn check_new_username(&self, principal: &Principal, text: &str) -> LedgerResult<String> {
        let username = text.trim();
        if !is_valid_username(username) {
            return Err(ValidationError::InvalidUsername.into());
        }
        if self
            .store
            .client_by_username(principal.agent.id, username)
            .await?
            .is_some()
        {
            return Err(ValidationError::UsernameTaken.into());
        }
        if self.gateway.lookup_by_username(username).await?.is_some() {
            tracing::info!(username, "Username already present in gateway");
            return Err(ValidationError::UsernameTaken.into());
        }
        Ok(username.to_string())
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    fn start_renew(&self, principal: &Principal) -> LedgerResult<Transition> {
        if !principal.is_privileged() {
            ensure_active(&principal.agent)?;
            ledger::ensure_within_limit(&principal.agent, 0)?;
        }
        Ok(Transition::Next(Session::Renew(RenewState::AwaitingTarget)))
    }

    async fn renew_step(
        &self,
        principal: &Principal,
        state: RenewState,
        input: Input,
    ) -> LedgerResult<Transition> {
        let next = match (state, input) {
            (RenewState::AwaitingTarget, Input::PickClient { client_id }) => {
                let client = self.store.client_by_id(client_id).await?;
                RenewState::AwaitingDays {
                    target: self.pick_target(principal, client)?,
                }
            }
            (RenewState::AwaitingTarget, Input::Text { text }) => {
                let client = self.client_by_username(principal, text.trim()).await?;
                RenewState::AwaitingDays {
                    target: self.pick_target(principal, client)?,
                }
            }

            (RenewState::AwaitingDays { .. }, Input::Back) => RenewState::AwaitingTarget,
            (RenewState::AwaitingDays { target }, input) => {
                let days = self.days_input(input, false)?;
                if self.renewal_tariffs(target.agent_id).await?.is_empty() {
                    RenewState::AwaitingPrice {
                        target,
                        days,
                        tariff: self.fallback_tariff(),
                    }
                } else {
                    RenewState::AwaitingTariff { target, days }
                }
            }

            (RenewState::AwaitingTariff { target, .. }, Input::Back) => {
                RenewState::AwaitingDays { target }
            }
            (RenewState::AwaitingTariff { target, days }, Input::PickTariff { tariff_id }) => {
                let tariff = find_tariff(&self.renewal_tariffs(target.agent_id).await?, tariff_id)?;
                let agent = self.target_agent(target.agent_id).await?;
                let share = pricing::owner_share(days, tariff.base_price, self.period_days());
                ledger::ensure_within_limit(&agent, share)?;
                RenewState::AwaitingPrice {
                    target,
                    days,
                    tariff,
                }
            }
            (RenewState::AwaitingTariff { target, days }, Input::SameTariff) => {
                let tariff = self.same_tariff(&target).await?;
                if target.old_monthly_price > 0 {
                    let draft = RenewalDraft {
                        monthly_price: target.old_monthly_price,
                        target,
                        days,
                        tariff,
                    };
                    let receipt = self.commit_renewal(principal, draft).await?;
                    return Ok(Transition::Done(Outcome::Renewed { receipt }));
                }
                RenewState::AwaitingPrice {
                    target,
                    days,
                    tariff,
                }
            }

            (RenewState::AwaitingPrice { target, days, .. }, Input::Back) => {
                if self.renewal_tariffs(target.agent_id).await?.is_empty() {
                    RenewState::AwaitingDays { target }
                } else {
                    RenewState::AwaitingTariff { target, days }
                }
            }
            (
                RenewState::AwaitingPrice {
                    target,
                    days,
                    tariff,
                },
                input,
            ) => {
                let draft = RenewalDraft {
                    monthly_price: price_input(input)?,
                    target,
                    days,
                    tariff,
                };
                let receipt = self.commit_renewal(principal, draft).await?;
                return Ok(Transition::Done(Outcome::Renewed { receipt }));
            }

            _ => return Err(ValidationError::UseButtons.into()),
        };
        Ok(Transition::Next(Session::Renew(next)))
    }

    async fn client_by_username(
        &self,
        principal: &Principal,
        username: &str,
    ) -> LedgerResult<Option<Client>> {
        if principal.is_privileged() {
            let clients = self.store.list_clients(None).await?;
            return Ok(clients.into_iter().find(|c| c.username == username));
        }
        Ok(self
            .store
            .client_by_username(principal.agent.id, username)
            .await?)
    }

    /// Check access and the "too early" window, and capture the current terms.
    fn pick_target(&self, principal: &Principal, client: Option<Client>) -> LedgerResult<RenewTarget> {
        let client = client
            .filter(|c| principal.is_privileged() || c.agent_id == principal.agent.id)
            .ok_or(ValidationError::UnknownClient)?;

        let days_left = pricing::days_left(client.expires_at, OffsetDateTime::now_utc());
        let min_days_left = self.config.pricing.renew_min_days_left;
        if days_left > min_days_left {
            return Err(LedgerError::TooEarly {
                days_left,
                min_days_left,
            });
        }

        Ok(RenewTarget {
            client_id: client.id,
            agent_id: client.agent_id,
            username: client.username,
            days_left,
            old_tariff_name: client.tariff_name,
            old_base_price: client
                .tariff_base_price
                .filter(|p| *p > 0)
                .unwrap_or(self.config.pricing.base_price),
            old_monthly_price: client.monthly_price,
        })
    }

    async fn target_agent(&self, agent_id: i64) -> LedgerResult<Agent> {
        self.store
            .agent_by_id(agent_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("agent {}", agent_id)))
    }

    /// Tariffs offered when renewing a client of `agent_id`.
    async fn renewal_tariffs(&self, agent_id: i64) -> LedgerResult<Vec<Tariff>> {
        let agent = self.target_agent(agent_id).await?;
        Ok(self.config.tariffs.visible_to(agent.telegram_id, false))
    }

    /// The previous tariff re-resolved by name; its base price may have changed.
    async fn same_tariff(&self, target: &RenewTarget) -> LedgerResult<ChosenTariff> {
        let tariffs = self.renewal_tariffs(target.agent_id).await?;
        let matched = target
            .old_tariff_name
            .as_deref()
            .and_then(|name| tariffs.iter().find(|t| t.name == name));

        Ok(match matched {
            Some(tariff) => ChosenTariff {
                id: Some(tariff.id),
                name: Some(tariff.name.clone()),
                base_price: tariff.base_price,
            },
            None => ChosenTariff {
                id: None,
                name: target.old_tariff_name.clone(),
                base_price: target.old_base_price,
            },
        })
    }

    // =========================================================================
    // Repayment
    // =========================================================================

    async fn pay_debt_step(&self, principal: &Principal, input: Input) -> LedgerResult<Transition> {
        let amount = match input {
            Input::Text { text } => parse_number(&text)?,
            Input::PickPrice { price } => price,
            _ => return Err(ValidationError::UseButtons.into()),
        };
        let request = self.transfers.request(principal, amount).await?;
        Ok(Transition::Done(Outcome::TransferRequested { request }))
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    fn fallback_tariff(&self) -> ChosenTariff {
        ChosenTariff {
            id: None,
            name: None,
            base_price: self.config.pricing.base_price,
        }
    }

    fn days_input(&self, input: Input, typed: bool) -> Result<i64, ValidationError> {
        let days = match input {
            Input::PickDays { days } => days,
            Input::Skip => return Ok(self.period_days()),
            Input::Text { text } if typed => parse_number(&text)?,
            _ => return Err(ValidationError::UseButtons),
        };
        check_days(days)?;
        Ok(days)
    }

    /// The prompt shown while `session` waits for input. `None` when idle.
    async fn prompt_for(
        &self,
        principal: &Principal,
        session: &Session,
    ) -> LedgerResult<Option<Prompt>> {
        let period = self.period_days();
        let days_prompt = |typed: bool| Prompt::Days {
            options: DAY_OPTIONS.to_vec(),
            default_days: period,
            typed,
        };

        let prompt = match session {
            Session::Idle => return Ok(None),
            Session::PayDebt => Prompt::RepaymentAmount {
                current_debt: principal.agent.current_debt,
            },

            Session::Create(CreateState::AwaitingUsername) => Prompt::Username,
            Session::Create(CreateState::AwaitingDays { .. }) => days_prompt(true),
            Session::Create(CreateState::AwaitingTariff { .. }) => Prompt::Tariff {
                tariffs: self.creation_tariffs(principal),
                keep_current: false,
                current_tariff: None,
            },
            Session::Create(CreateState::AwaitingPrice { tariff, .. }) => Prompt::Price {
                tariff_name: tariff.name.clone(),
                base_price: tariff.base_price,
                presets: pricing::amount_presets(tariff.base_price, None),
                current_price: None,
                upgrade_correction: 0,
            },
            Session::Create(CreateState::AwaitingConfirmation {
                username,
                days,
                tariff,
                monthly_price,
            }) => Prompt::Confirm {
                username: username.clone(),
                tariff_name: tariff.name.clone(),
                quote: CreationQuote::new(*days, tariff.base_price, *monthly_price, period),
            },

            Session::Renew(RenewState::AwaitingTarget) => {
                let scope = (!principal.is_privileged()).then_some(principal.agent.id);
                Prompt::Target {
                    clients: self.store.list_clients(scope).await?,
                }
            }
            Session::Renew(RenewState::AwaitingDays { .. }) => days_prompt(false),
            Session::Renew(RenewState::AwaitingTariff { target, .. }) => Prompt::Tariff {
                tariffs: self.renewal_tariffs(target.agent_id).await?,
                keep_current: true,
                current_tariff: target.old_tariff_name.clone(),
            },
            Session::Renew(RenewState::AwaitingPrice { target, tariff, .. }) => {
                let current = Some(target.old_monthly_price).filter(|p| *p > 0);
                Prompt::Price {
                    tariff_name: tariff.name.clone(),
                    base_price: tariff.base_price,
                    presets: pricing::amount_presets(tariff.base_price, current),
                    current_price: current,
                    upgrade_correction: pricing::upgrade_correction(
                        target.old_base_price,
                        tariff.base_price,
                        target.days_left,
                        period,
                    ),
                }
            }
        };
        Ok(Some(prompt))
    }
}

fn menu() -> StepResult {
    StepResult {
        session: Session::Idle,
        outcome: Outcome::Menu,
    }
}

fn failed(error: LedgerError) -> StepResult {
    tracing::info!(code = error.code(), error = %error, "Dialogue flow aborted");
    StepResult {
        session: Session::Idle,
        outcome: Outcome::Failed { error },
    }
}

fn ensure_active(agent: &Agent) -> LedgerResult<()> {
    if agent.is_active {
        Ok(())
    } else {
        Err(LedgerError::AgentInactive)
    }
}

/// A granted period is within `1..=MAX_DAYS`.
fn check_days(days: i64) -> Result<(), ValidationError> {
    if days <= 0 {
        Err(ValidationError::NonPositiveDays)
    } else if days > MAX_DAYS {
        Err(ValidationError::TooManyDays)
    } else {
        Ok(())
    }
}

/// 3 to 36 latin letters, digits, `_` or `-`.
pub fn is_valid_username(username: &str) -> bool {
    (3..=36).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn find_tariff(tariffs: &[Tariff], tariff_id: u32) -> Result<ChosenTariff, ValidationError> {
    tariffs
        .iter()
        .find(|t| t.id == tariff_id)
        .map(|t| ChosenTariff {
            id: Some(t.id),
            name: Some(t.name.clone()),
            base_price: t.base_price,
        })
        .ok_or(ValidationError::UnknownTariff)
}

fn price_input(input: Input) -> Result<i64, ValidationError> {
    let price = match input {
        Input::PickPrice { price } => price,
        Input::Text { text } => parse_number(&text)?,
        _ => return Err(ValidationError::UseButtons),
    };
    if price <= 0 {
        return Err(ValidationError::NonPositiveAmount);
    }
    Ok(price)
}
