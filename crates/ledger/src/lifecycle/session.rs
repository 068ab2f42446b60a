//! Dialogue state and the values exchanged with the chat layer
//!
//! A [`Session`] is a plain value: the engine takes the current one and an
//! [`Input`], and hands back the next one with an [`Outcome`] to render.

use resell_shared::{Client, Tariff, TransferRequest};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, ValidationError};
use crate::pricing::{CreationQuote, RenewalQuote};

/// Day counts offered as buttons.
pub const DAY_OPTIONS: [i64; 4] = [30, 90, 180, 365];

/// Longest period a single creation or renewal may grant.
pub const MAX_DAYS: i64 = 3650;

const CANCEL_TOKENS: [&str; 4] = ["/cancel", "cancel", "отмена", "стоп"];
const SKIP_TOKENS: [&str; 3] = ["/skip", "skip", "пропустить"];

/// One user action: a button press or a typed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Input {
    StartCreate,
    StartRenew,
    StartPayDebt,
    Text { text: String },
    PickDays { days: i64 },
    Skip,
    PickTariff { tariff_id: u32 },
    SameTariff,
    PickClient { client_id: i64 },
    PickPrice { price: i64 },
    Confirm,
    Back,
    Cancel,
    Restart,
}

impl Input {
    /// Map typed control words onto the matching buttons.
    pub fn normalize(self) -> Input {
        match self {
            Input::Text { text } => {
                let token = text.trim().to_lowercase();
                if CANCEL_TOKENS.contains(&token.as_str()) {
                    Input::Cancel
                } else if token == "/start" {
                    Input::Restart
                } else if SKIP_TOKENS.contains(&token.as_str()) {
                    Input::Skip
                } else {
                    Input::Text { text }
                }
            }
            other => other,
        }
    }
}

/// Parse a typed whole number.
pub(crate) fn parse_number(text: &str) -> Result<i64, ValidationError> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| ValidationError::InvalidNumber)
}

/// The tariff a flow settled on. `id` is `None` for the fallback base price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChosenTariff {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub base_price: i64,
}

/// The subscription being renewed, captured when it was picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewTarget {
    pub client_id: i64,
    pub agent_id: i64,
    pub username: String,
    pub days_left: i64,
    pub old_tariff_name: Option<String>,
    pub old_base_price: i64,
    pub old_monthly_price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CreateState {
    AwaitingUsername,
    AwaitingDays {
        username: String,
    },
    AwaitingTariff {
        username: String,
        days: i64,
    },
    AwaitingPrice {
        username: String,
        days: i64,
        tariff: ChosenTariff,
    },
    AwaitingConfirmation {
        username: String,
        days: i64,
        tariff: ChosenTariff,
        monthly_price: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RenewState {
    AwaitingTarget,
    AwaitingDays {
        target: RenewTarget,
    },
    AwaitingTariff {
        target: RenewTarget,
        days: i64,
    },
    AwaitingPrice {
        target: RenewTarget,
        days: i64,
        tariff: ChosenTariff,
    },
}

/// Per-user dialogue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum Session {
    #[default]
    Idle,
    Create(CreateState),
    Renew(RenewState),
    PayDebt,
}

/// What the user should be asked next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "prompt", rename_all = "snake_case")]
pub enum Prompt {
    Username,
    Days {
        options: Vec<i64>,
        default_days: i64,
        /// Typed numbers are accepted besides the buttons
        typed: bool,
    },
    Tariff {
        tariffs: Vec<Tariff>,
        /// Offers the "same as before" shortcut
        keep_current: bool,
        current_tariff: Option<String>,
    },
    Price {
        tariff_name: Option<String>,
        base_price: i64,
        presets: Vec<i64>,
        current_price: Option<i64>,
        upgrade_correction: i64,
    },
    Confirm {
        username: String,
        tariff_name: Option<String>,
        quote: CreationQuote,
    },
    Target {
        clients: Vec<Client>,
    },
    RepaymentAmount {
        current_debt: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CreationReceipt {
    pub client: Client,
    pub quote: CreationQuote,
    pub current_debt: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewalReceipt {
    pub client: Client,
    pub quote: RenewalQuote,
    pub current_debt: i64,
}

/// What happened in one step.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Back at the main menu
    Menu,
    Prompt { prompt: Prompt },
    /// The input was rejected; ask again
    Retry { error: LedgerError, prompt: Prompt },
    ClientCreated { receipt: CreationReceipt },
    Renewed { receipt: RenewalReceipt },
    TransferRequested { request: TransferRequest },
    /// The flow ended with an error and the session was cleared
    Failed { error: LedgerError },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub session: Session,
    pub outcome: Outcome,
}
