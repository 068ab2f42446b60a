//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use resell_ledger::LedgerError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Missing or invalid X-Telegram-Id header")]
    MissingActor,

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::MissingActor | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(err) => match err {
                LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::CreditLimitExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
                LedgerError::AlreadyExists(_)
                | LedgerError::AlreadyProcessed { .. }
                | LedgerError::TooEarly { .. } => StatusCode::CONFLICT,
                LedgerError::AgentInactive | LedgerError::AccessDenied => StatusCode::FORBIDDEN,
                LedgerError::Gateway(_) => StatusCode::BAD_GATEWAY,
                LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Ledger(err) => err.code(),
            ApiError::InvalidApiKey => "invalid_api_key",
            ApiError::MissingActor => "missing_actor",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Ledger(LedgerError::Database(detail)) => {
                tracing::error!(error = %detail, "Database error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": message,
            "code": self.code(),
        });
        if let ApiError::Ledger(err @ (LedgerError::CreditLimitExceeded { .. }
        | LedgerError::TooEarly { .. }
        | LedgerError::Validation(_))) = &self
        {
            body["details"] = serde_json::to_value(err).unwrap_or_default();
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resell_ledger::{GatewayError, ValidationError};

    #[test]
    fn test_ledger_errors_map_to_status() {
        let cases = [
            (
                LedgerError::Validation(ValidationError::InvalidUsername),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                LedgerError::NotFound("agent 7".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                LedgerError::CreditLimitExceeded {
                    current_debt: 400,
                    credit_limit: 500,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                LedgerError::AlreadyProcessed { request_id: 3 },
                StatusCode::CONFLICT,
            ),
            (LedgerError::AccessDenied, StatusCode::FORBIDDEN),
            (
                LedgerError::Gateway(GatewayError::Transport("timeout".to_string())),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_api_errors_map_to_status() {
        assert_eq!(ApiError::InvalidApiKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::MissingActor.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingActor.code(), "missing_actor");
    }

    #[tokio::test]
    async fn test_limit_error_body_carries_balance() {
        let response = ApiError::from(LedgerError::CreditLimitExceeded {
            current_debt: 400,
            credit_limit: 500,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "credit_limit_exceeded");
        assert_eq!(body["details"]["current_debt"], 400);
        assert_eq!(body["details"]["credit_limit"], 500);
    }

    #[tokio::test]
    async fn test_database_detail_is_hidden() {
        let response =
            ApiError::from(LedgerError::Database("relation agents missing".to_string()))
                .into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Internal server error");
    }
}
