//! Ledger error types

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Bad input that the dialogue recovers from by prompting again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationError {
    #[error("username must be 3-36 latin letters, digits, '_' or '-'")]
    InvalidUsername,
    #[error("username is already taken")]
    UsernameTaken,
    #[error("expected a whole number")]
    InvalidNumber,
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("day count must be positive")]
    NonPositiveDays,
    #[error("day count must not exceed 3650")]
    TooManyDays,
    #[error("choose one of the offered options")]
    UseButtons,
    #[error("tariff is not available")]
    UnknownTariff,
    #[error("client is not available")]
    UnknownClient,
    #[error("credit limit cannot be negative")]
    NegativeLimit,
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credit limit exceeded: debt {current_debt}, limit {credit_limit}")]
    CreditLimitExceeded {
        current_debt: i64,
        credit_limit: i64,
    },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("provisioning failed: {0}")]
    Gateway(GatewayError),

    #[error("transfer request {request_id} was already processed")]
    AlreadyProcessed { request_id: i64 },

    #[error("agent is inactive")]
    AgentInactive,

    #[error("access denied")]
    AccessDenied,

    #[error("renewal is too early: {days_left} days left, allowed from {min_days_left}")]
    TooEarly { days_left: i64, min_days_left: i64 },

    #[error("database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Stable machine-readable code for the chat layer.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::CreditLimitExceeded { .. } => "credit_limit_exceeded",
            LedgerError::AlreadyExists(_) => "already_exists",
            LedgerError::Gateway(_) => "gateway",
            LedgerError::AlreadyProcessed { .. } => "already_processed",
            LedgerError::AgentInactive => "agent_inactive",
            LedgerError::AccessDenied => "access_denied",
            LedgerError::TooEarly { .. } => "too_early",
            LedgerError::Database(_) => "database",
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => LedgerError::NotFound(what),
            StoreError::Conflict(what) => LedgerError::AlreadyExists(what),
            StoreError::Database(msg) => LedgerError::Database(msg),
        }
    }
}

impl From<GatewayError> for LedgerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::AlreadyExists(username) => LedgerError::AlreadyExists(username),
            other => LedgerError::Gateway(other),
        }
    }
}

impl Serialize for LedgerError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("code", self.code())?;
        map.serialize_entry("message", &self.to_string())?;
        match self {
            LedgerError::Validation(reason) => map.serialize_entry("reason", reason)?,
            LedgerError::CreditLimitExceeded {
                current_debt,
                credit_limit,
            } => {
                map.serialize_entry("current_debt", current_debt)?;
                map.serialize_entry("credit_limit", credit_limit)?;
            }
            LedgerError::AlreadyProcessed { request_id } => {
                map.serialize_entry("request_id", request_id)?
            }
            LedgerError::TooEarly {
                days_left,
                min_days_left,
            } => {
                map.serialize_entry("days_left", days_left)?;
                map.serialize_entry("min_days_left", min_days_left)?;
            }
            _ => {}
        }
        map.end()
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_conflict_maps_to_already_exists() {
        let err: LedgerError = GatewayError::AlreadyExists("ivan_01".to_string()).into();
        assert!(matches!(err, LedgerError::AlreadyExists(ref u) if u == "ivan_01"));

        let err: LedgerError = GatewayError::Status {
            status: 500,
            body: "boom".to_string(),
        }
        .into();
        assert_eq!(err.code(), "gateway");
    }

    #[test]
    fn test_store_errors_map_by_kind() {
        let err: LedgerError = StoreError::Conflict("client ivan_01".to_string()).into();
        assert_eq!(err.code(), "already_exists");
        let err: LedgerError = StoreError::Database("io".to_string()).into();
        assert_eq!(err.code(), "database");
    }

    #[test]
    fn test_serialized_limit_error_carries_amounts() {
        let err = LedgerError::CreditLimitExceeded {
            current_debt: 400,
            credit_limit: 500,
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "credit_limit_exceeded");
        assert_eq!(value["current_debt"], 400);
        assert_eq!(value["credit_limit"], 500);
    }

    #[test]
    fn test_serialized_validation_error_carries_reason() {
        let err = LedgerError::Validation(ValidationError::NonPositiveDays);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["reason"], "non_positive_days");
    }
}
