//! Remnawave panel client
//!
//! Endpoints used:
//! - `GET /api/users/by-username/{username}` (404 means absent)
//! - `POST /api/users` to create
//! - `PATCH /api/users` to extend, with the user's uuid in the body
//!
//! Successful payloads may be wrapped in a `response` object.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use resell_shared::{GatewayConfig, GatewayMode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    CreateUser, ExtendUser, GatewayError, GatewayResult, GatewayUser, ProvisioningGateway,
    ProvisioningOptions,
};

/// HTTP client for the Remnawave panel API.
#[derive(Clone)]
pub struct RemnawaveGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    mode: GatewayMode,
    caddy_token: Option<String>,
}

impl RemnawaveGateway {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            mode: config.mode,
            caddy_token: config.caddy_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(ACCEPT, "application/json");

        builder = match &self.caddy_token {
            Some(token) => builder
                .header(AUTHORIZATION, format!("Basic {}", token))
                .header("X-Api-Key", &self.api_key),
            None => builder.bearer_auth(&self.api_key),
        };

        if self.mode == GatewayMode::Local {
            builder = builder
                .header("x-forwarded-for", "127.0.0.1")
                .header("x-forwarded-proto", "https");
        }
        builder
    }

    async fn send_user(
        &self,
        method: Method,
        username: &str,
        payload: &UserPayload<'_>,
    ) -> GatewayResult<GatewayUser> {
        let response = self
            .request(method.clone(), "/api/users")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let conflict = status == StatusCode::CONFLICT
                || body.to_lowercase().contains("already exists");
            if method == Method::POST && conflict {
                tracing::warn!(username = %username, "Gateway reports user already exists");
                return Err(GatewayError::AlreadyExists(username.to_string()));
            }
            tracing::error!(
                username = %username,
                method = %method,
                status = %status,
                body = %body,
                "Gateway user request failed"
            );
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        read_user(response)
            .await?
            .ok_or_else(|| GatewayError::Decode("empty user payload".to_string()))
    }
}

#[async_trait]
impl ProvisioningGateway for RemnawaveGateway {
    async fn lookup_by_username(&self, username: &str) -> GatewayResult<Option<GatewayUser>> {
        let response = self
            .request(Method::GET, &format!("/api/users/by-username/{}", username))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                username = %username,
                status = %status,
                body = %body,
                "Gateway lookup failed"
            );
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        read_user(response).await
    }

    async fn create(&self, request: &CreateUser) -> GatewayResult<GatewayUser> {
        let payload = UserPayload::new(
            None,
            Some(&request.username),
            request.expire_at,
            &request.options,
        );
        let user = self
            .send_user(Method::POST, &request.username, &payload)
            .await?;
        tracing::info!(username = %request.username, uuid = %user.uuid, "Gateway user created");
        Ok(user)
    }

    async fn extend(&self, request: &ExtendUser) -> GatewayResult<GatewayUser> {
        let payload = UserPayload::new(Some(&request.uuid), None, request.expire_at, &request.options);
        let user = self
            .send_user(Method::PATCH, &request.uuid, &payload)
            .await?;
        tracing::info!(uuid = %request.uuid, "Gateway user extended");
        Ok(user)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    expire_at: OffsetDateTime,
    traffic_limit_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    traffic_limit_strategy: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    telegram_id: Option<i64>,
    hwid_device_limit: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    active_internal_squads: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_squad_uuid: Option<&'a str>,
}

impl<'a> UserPayload<'a> {
    fn new(
        uuid: Option<&'a str>,
        username: Option<&'a str>,
        expire_at: OffsetDateTime,
        options: &'a ProvisioningOptions,
    ) -> Self {
        Self {
            uuid,
            username,
            status: "ACTIVE",
            // Whole seconds only
            expire_at: expire_at.replace_nanosecond(0).unwrap_or(expire_at),
            traffic_limit_bytes: options.traffic_limit_bytes,
            traffic_limit_strategy: options.traffic_reset_strategy.as_deref(),
            description: options.description.as_deref(),
            tag: options.tag.as_deref(),
            telegram_id: options.telegram_id,
            hwid_device_limit: options.hwid_device_limit,
            active_internal_squads: options.internal_squads.clone(),
            external_squad_uuid: options.external_squad.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    uuid: String,
    username: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expire_at: Option<OffsetDateTime>,
    #[serde(default)]
    subscription_url: Option<String>,
}

impl From<UserResponse> for GatewayUser {
    fn from(user: UserResponse) -> Self {
        GatewayUser {
            uuid: user.uuid,
            username: user.username,
            expire_at: user.expire_at,
            subscription_url: user.subscription_url.filter(|u| !u.is_empty()),
        }
    }
}

/// Decode a user from a possibly wrapped object or list payload.
async fn read_user(response: Response) -> GatewayResult<Option<GatewayUser>> {
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))?;
    parse_user(body)
}

fn parse_user(body: serde_json::Value) -> GatewayResult<Option<GatewayUser>> {
    let payload = match body {
        serde_json::Value::Object(mut map) if map.contains_key("response") => {
            map.remove("response").unwrap_or_default()
        }
        other => other,
    };

    let payload = match payload {
        serde_json::Value::Array(items) => match items.into_iter().next() {
            Some(first) => first,
            None => return Ok(None),
        },
        serde_json::Value::Null => return Ok(None),
        other => other,
    };

    let user: UserResponse =
        serde_json::from_value(payload).map_err(|e| GatewayError::Decode(e.to_string()))?;
    Ok(Some(user.into()))
}
