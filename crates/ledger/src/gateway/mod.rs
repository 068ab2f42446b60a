//! Provisioning Gateway
//!
//! Contract of the external system that actually grants and extends VPN
//! access. It is authoritative for subscription existence, expiry and access
//! link. Failures are surfaced to the caller and never retried here.

pub mod memory;
pub mod remnawave;

use async_trait::async_trait;
use resell_shared::ProvisioningParams;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub use memory::InMemoryGateway;
pub use remnawave::RemnawaveGateway;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("unexpected gateway response: {0}")]
    Decode(String),

    #[error("user {0} already exists in the gateway")]
    AlreadyExists(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// A user as the gateway reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUser {
    pub uuid: String,
    pub username: String,
    pub expire_at: Option<OffsetDateTime>,
    pub subscription_url: Option<String>,
}

/// Provisioning fields sent with create and extend calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningOptions {
    pub description: Option<String>,
    pub telegram_id: Option<i64>,
    pub traffic_limit_bytes: i64,
    pub traffic_reset_strategy: Option<String>,
    pub hwid_device_limit: i64,
    pub tag: Option<String>,
    pub internal_squads: Vec<String>,
    pub external_squad: Option<String>,
}

const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

impl ProvisioningOptions {
    /// Merge tariff parameters over the global defaults and normalize them
    /// into what the gateway accepts.
    pub fn resolve(
        tariff: &ProvisioningParams,
        defaults: &ProvisioningParams,
        agent_telegram_id: i64,
        client_telegram_id: Option<i64>,
    ) -> Self {
        let params = tariff.or(defaults);

        let traffic_limit_bytes = params
            .traffic_limit_gb
            .filter(|gb| *gb > 0)
            .map(|gb| gb.saturating_mul(BYTES_PER_GB))
            .unwrap_or(0);

        Self {
            description: Some(format!("agent:{}", agent_telegram_id)),
            telegram_id: client_telegram_id,
            traffic_limit_bytes,
            traffic_reset_strategy: params
                .traffic_reset_strategy
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
            hwid_device_limit: params.hwid_device_limit.unwrap_or(0).max(0),
            tag: params.tag.as_deref().and_then(normalize_tag),
            internal_squads: params
                .internal_squads
                .unwrap_or_default()
                .iter()
                .filter_map(|s| normalize_uuid(s))
                .collect(),
            external_squad: params.external_squad.as_deref().and_then(normalize_uuid),
        }
    }
}

/// Uppercased tag, or `None` unless it is made of `[A-Z0-9_]`.
fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.trim().to_uppercase();
    let valid = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    valid.then_some(tag)
}

fn normalize_uuid(raw: &str) -> Option<String> {
    Uuid::parse_str(raw.trim())
        .ok()
        .map(|u| u.hyphenated().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUser {
    pub username: String,
    pub expire_at: OffsetDateTime,
    pub options: ProvisioningOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendUser {
    pub uuid: String,
    pub expire_at: OffsetDateTime,
    pub options: ProvisioningOptions,
}

#[async_trait]
pub trait ProvisioningGateway: Send + Sync {
    /// `None` when the gateway does not know the username.
    async fn lookup_by_username(&self, username: &str) -> GatewayResult<Option<GatewayUser>>;

    async fn create(&self, request: &CreateUser) -> GatewayResult<GatewayUser>;

    async fn extend(&self, request: &ExtendUser) -> GatewayResult<GatewayUser>;
}

/// Extension target: `days` after the later of now and the current expiry.
/// `None` when the result does not fit a timestamp.
pub fn extended_expiry(
    current: Option<OffsetDateTime>,
    now: OffsetDateTime,
    days: i64,
) -> Option<OffsetDateTime> {
    let start = match current {
        Some(expires_at) if expires_at > now => expires_at,
        _ => now,
    };
    start.checked_add(Duration::days(days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_expiry_counts_from_future_expiry() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1000);
        let current = now + Duration::days(5);
        assert_eq!(
            extended_expiry(Some(current), now, 30),
            Some(now + Duration::days(35))
        );
    }

    #[test]
    fn test_extended_expiry_counts_from_now_when_expired() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1000);
        assert_eq!(
            extended_expiry(Some(now - Duration::days(3)), now, 30),
            Some(now + Duration::days(30))
        );
        assert_eq!(
            extended_expiry(None, now, 30),
            Some(now + Duration::days(30))
        );
    }

    #[test]
    fn test_extended_expiry_out_of_range_is_none() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1000);
        assert_eq!(extended_expiry(None, now, i64::MAX / 86_400), None);
        let far = time::Date::MAX.midnight().assume_utc();
        assert_eq!(extended_expiry(Some(far), now, 1), None);
    }

    #[test]
    fn test_resolve_normalizes_parameters() {
        let defaults = ProvisioningParams {
            traffic_limit_gb: Some(0),
            traffic_reset_strategy: Some("month".to_string()),
            hwid_device_limit: Some(2),
            tag: Some("resell-vip".to_string()),
            internal_squads: Some(vec![
                "not-a-uuid".to_string(),
                "6BA7B810-9DAD-11D1-80B4-00C04FD430C8".to_string(),
            ]),
            external_squad: Some("nope".to_string()),
        };
        let tariff = ProvisioningParams {
            traffic_limit_gb: Some(100),
            ..Default::default()
        };

        let options = ProvisioningOptions::resolve(&tariff, &defaults, 42, None);

        assert_eq!(options.description.as_deref(), Some("agent:42"));
        assert_eq!(options.traffic_limit_bytes, 100 * BYTES_PER_GB);
        assert_eq!(options.traffic_reset_strategy.as_deref(), Some("MONTH"));
        assert_eq!(options.hwid_device_limit, 2);
        assert_eq!(options.tag, None);
        assert_eq!(
            options.internal_squads,
            vec!["6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_string()]
        );
        assert_eq!(options.external_squad, None);
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag(" vip_1 "), Some("VIP_1".to_string()));
        assert_eq!(normalize_tag("with space"), None);
        assert_eq!(normalize_tag(""), None);
    }
}
