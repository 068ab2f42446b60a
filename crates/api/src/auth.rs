//! Request authentication
//!
//! The chat adapter authenticates with a shared key in `X-Api-Key` and names
//! the acting chat user in `X-Telegram-*` headers.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use resell_ledger::Actor;
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

pub const API_KEY_HEADER: &str = "X-Api-Key";
pub const TELEGRAM_ID_HEADER: &str = "X-Telegram-Id";
pub const TELEGRAM_NAME_HEADER: &str = "X-Telegram-Name";
pub const TELEGRAM_USERNAME_HEADER: &str = "X-Telegram-Username";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Middleware that requires the shared API key
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = header_str(request.headers(), API_KEY_HEADER).unwrap_or_default();
    let valid: bool = presented
        .as_bytes()
        .ct_eq(state.api_key.as_bytes())
        .into();

    if !valid {
        tracing::warn!(path = %request.uri().path(), "Rejected request with invalid API key");
        return ApiError::InvalidApiKey.into_response();
    }
    next.run(request).await
}

/// The chat user on whose behalf the adapter calls
#[derive(Debug, Clone)]
pub struct ChatUser(pub Actor);

impl ChatUser {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let telegram_id = header_str(headers, TELEGRAM_ID_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|id| *id > 0)
            .ok_or(ApiError::MissingActor)?;

        Ok(Self(Actor {
            telegram_id,
            name: header_str(headers, TELEGRAM_NAME_HEADER)
                .unwrap_or_default()
                .to_string(),
            username: header_str(headers, TELEGRAM_USERNAME_HEADER).map(String::from),
        }))
    }
}

impl<S> FromRequestParts<S> for ChatUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}
