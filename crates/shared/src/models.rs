//! Persisted domain records
//!
//! Amounts are whole currency units stored as `BIGINT`.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// A reseller who provisions subscriptions for their own customers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: i64,
    pub telegram_id: i64,
    pub name: String,
    pub telegram_username: Option<String>,
    pub is_active: bool,
    /// 0 means unlimited
    pub credit_limit: i64,
    /// Only changed through ledger adjustments
    pub current_debt: i64,
    /// Stored and reported, not used in pricing
    pub owner_share_percent: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Agent {
    /// Name shown to the owner: `@username` when known, the display name otherwise.
    pub fn display_name(&self) -> String {
        match &self.telegram_username {
            Some(username) => format!("@{}", username),
            None => self.name.clone(),
        }
    }
}

/// Agent plus the number of clients it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AgentOverview {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub agent: Agent,
    pub client_count: i64,
}

/// Fields for registering an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    pub telegram_id: i64,
    pub name: String,
    pub telegram_username: Option<String>,
    pub credit_limit: i64,
    pub owner_share_percent: i32,
}

impl NewAgent {
    /// Strips a leading `@`, trims and lowercases; empty becomes `None`.
    pub fn normalize_username(username: Option<&str>) -> Option<String> {
        username
            .map(|u| u.trim().trim_start_matches('@').trim().to_lowercase())
            .filter(|u| !u.is_empty())
    }
}

/// One customer's VPN subscription, owned by exactly one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub id: i64,
    pub agent_id: i64,
    pub telegram_id: Option<i64>,
    pub username: String,
    pub subscription_link: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// Price the agent charges its customer per standard period
    pub monthly_price: i64,
    pub last_payment_amount: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
    pub tariff_name: Option<String>,
    pub tariff_base_price: Option<i64>,
    /// Expiry the agent was last warned about
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_notified_for: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields for inserting a freshly provisioned client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClient {
    pub agent_id: i64,
    pub telegram_id: Option<i64>,
    pub username: String,
    pub subscription_link: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub monthly_price: i64,
    pub last_payment_amount: Option<i64>,
    pub last_payment_at: Option<OffsetDateTime>,
    pub tariff_name: Option<String>,
    pub tariff_base_price: Option<i64>,
}

/// Overwrite applied to a client after a successful extension, plus the
/// history row recorded with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalUpdate {
    pub client_id: i64,
    pub days: i64,
    pub expires_at: OffsetDateTime,
    /// Kept as-is when the gateway did not return one
    pub subscription_link: Option<String>,
    pub monthly_price: i64,
    pub payment_amount: i64,
    pub paid_at: OffsetDateTime,
    pub tariff_name: Option<String>,
    pub tariff_base_price: i64,
    pub debt_amount: i64,
}

/// Append-only audit record of one debt adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DebtEvent {
    pub id: i64,
    pub agent_id: i64,
    /// Signed change actually applied to `current_debt`
    pub amount: i64,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only record of one renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Renewal {
    pub id: i64,
    pub agent_id: i64,
    pub client_id: i64,
    pub days: i64,
    pub debt_amount: i64,
    pub payment_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Status of a repayment claim. Both decisions are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Approved,
    Rejected,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Approved => "approved",
            TransferStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransferStatus::Pending),
            "approved" => Some(TransferStatus::Approved),
            "rejected" => Some(TransferStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent's claim that it paid back part of its debt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: i64,
    pub agent_id: i64,
    pub amount: i64,
    pub status: TransferStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
}
