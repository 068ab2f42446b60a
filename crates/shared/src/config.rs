//! Environment configuration
//!
//! Loaded once at startup and passed by reference to every component.
//! Parsing goes through a lookup closure so tests never touch the process
//! environment.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::tariff::{ProvisioningParams, Tariff, TariffCatalog, MAX_TARIFFS};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// How the gateway is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Public HTTPS endpoint
    Remote,
    /// Same host, behind a proxy that expects forwarded headers
    Local,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub mode: GatewayMode,
    /// When set, sent as `Authorization: Basic` with the API key moved to `X-Api-Key`
    pub caddy_token: Option<String>,
    pub timeout: Duration,
    /// Global provisioning defaults that tariffs override
    pub defaults: ProvisioningParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingConfig {
    /// Standard billing period in days
    pub period_days: i64,
    /// Base price owed when no tariff applies
    pub base_price: i64,
    /// Renewal is refused while more than this many days remain
    pub renew_min_days_left: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentDefaults {
    pub credit_limit: i64,
    pub owner_share_percent: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub sync_interval: Duration,
    pub expiry_notify_days: i64,
    pub expiry_notify_interval: Duration,
}

/// Caller role, derived from the configured principals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Agent,
}

impl Role {
    /// Owner and admins manage agents and may act on any client.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub api_key: Option<String>,
    pub bot_token: Option<String>,
    /// Expiry notice text; the worker's built-in wording when unset
    pub expiry_template: Option<String>,
    /// 0 when no owner is configured
    pub owner_telegram_id: i64,
    pub admin_ids: BTreeSet<i64>,
    pub gateway: GatewayConfig,
    pub pricing: PricingConfig,
    pub agent_defaults: AgentDefaults,
    pub schedule: ScheduleConfig,
    pub tariffs: TariffCatalog,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let mode = match env.get("REMNAWAVE_MODE").as_deref() {
            None => GatewayMode::Remote,
            Some(v) if v.eq_ignore_ascii_case("remote") => GatewayMode::Remote,
            Some(v) if v.eq_ignore_ascii_case("local") => GatewayMode::Local,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    key: "REMNAWAVE_MODE".to_string(),
                    value: v.to_string(),
                })
            }
        };

        let gateway = GatewayConfig {
            base_url: env
                .require("REMNAWAVE_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: env.require("REMNAWAVE_API_KEY")?,
            mode,
            caddy_token: env.get("REMNAWAVE_CADDY_TOKEN"),
            timeout: Duration::from_secs(env.number("REMNAWAVE_TIMEOUT_SECONDS", 30)?),
            defaults: ProvisioningParams {
                traffic_limit_gb: Some(env.number("REMNAWAVE_TRAFFIC_LIMIT_GB", 0)?),
                traffic_reset_strategy: Some(
                    env.get("REMNAWAVE_TRAFFIC_RESET_STRATEGY")
                        .unwrap_or_else(|| "MONTH".to_string()),
                ),
                hwid_device_limit: Some(env.number("REMNAWAVE_HWID_DEVICE_LIMIT", 0)?),
                tag: env.get("REMNAWAVE_TAG"),
                internal_squads: Some(split_list(
                    &env.get("REMNAWAVE_INTERNAL_SQUADS").unwrap_or_default(),
                )),
                external_squad: env.get("REMNAWAVE_EXTERNAL_SQUAD"),
            },
        };

        let admin_ids = env.id_set("ADMIN_IDS")?;

        Ok(Self {
            database_url: env.require("DATABASE_URL")?,
            bind_address: env
                .get("BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            api_key: env.get("API_KEY"),
            bot_token: env.get("BOT_TOKEN"),
            expiry_template: env.get("TEXT_SUBSCRIPTION_EXPIRING"),
            owner_telegram_id: env.number("OWNER_TELEGRAM_ID", 0)?,
            admin_ids,
            gateway,
            pricing: PricingConfig {
                period_days: env.number("DEFAULT_RENEW_DAYS", 30)?,
                base_price: env.number("BASE_SUBSCRIPTION_PRICE", 200)?,
                renew_min_days_left: env.number("RENEW_MIN_DAYS_LEFT", 10)?,
            },
            agent_defaults: AgentDefaults {
                credit_limit: env.number("DEFAULT_CREDIT_LIMIT", 0)?,
                owner_share_percent: env.number("DEFAULT_OWNER_SHARE_PERCENT", 100)?,
            },
            schedule: ScheduleConfig {
                sync_interval: Duration::from_secs(env.number("SYNC_INTERVAL_SECONDS", 300)?),
                expiry_notify_days: env.number("EXPIRY_NOTIFY_DAYS", 3)?,
                expiry_notify_interval: Duration::from_secs(
                    env.number("EXPIRY_NOTIFY_INTERVAL_SECONDS", 3600)?,
                ),
            },
            tariffs: load_tariffs(&env),
        })
    }

    pub fn role_of(&self, telegram_id: i64) -> Role {
        if self.owner_telegram_id != 0 && telegram_id == self.owner_telegram_id {
            Role::Owner
        } else if self.admin_ids.contains(&telegram_id) {
            Role::Admin
        } else {
            Role::Agent
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn id_set(&self, key: &str) -> Result<BTreeSet<i64>, ConfigError> {
        let raw = self.get(key).unwrap_or_default();
        split_list(&raw)
            .into_iter()
            .map(|item| {
                item.parse::<i64>().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value: item.clone(),
                })
            })
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Read the `TARIFF_{n}_*` slots. A slot without a positive base price is skipped.
fn load_tariffs<F>(env: &Env<F>) -> TariffCatalog
where
    F: Fn(&str) -> Option<String>,
{
    let mut tariffs = Vec::new();
    for idx in 1..=MAX_TARIFFS {
        let key = |field: &str| format!("TARIFF_{}_{}", idx, field);

        let raw_price = env.get(&key("BASE_PRICE"));
        let base_price = match raw_price.as_deref().map(str::parse::<i64>) {
            Some(Ok(price)) if price > 0 => price,
            None => continue,
            Some(_) => {
                tracing::warn!(slot = idx, "Tariff base price is not a positive integer, slot skipped");
                continue;
            }
        };

        let agent_ids = split_list(&env.get(&key("AGENT_IDS")).unwrap_or_default())
            .into_iter()
            .filter_map(|id| id.parse().ok())
            .collect();

        tariffs.push(Tariff {
            id: idx,
            name: env
                .get(&key("NAME"))
                .unwrap_or_else(|| format!("Tariff {}", idx)),
            base_price,
            description: env.get(&key("DESC")),
            agent_ids,
            provisioning: ProvisioningParams {
                traffic_limit_gb: env
                    .get(&key("TRAFFIC_LIMIT_GB"))
                    .and_then(|v| v.parse().ok()),
                traffic_reset_strategy: env.get(&key("TRAFFIC_RESET_STRATEGY")),
                hwid_device_limit: env
                    .get(&key("HWID_DEVICE_LIMIT"))
                    .and_then(|v| v.parse().ok()),
                tag: env.get(&key("TAG")),
                internal_squads: env
                    .get(&key("INTERNAL_SQUADS"))
                    .map(|raw| split_list(&raw)),
                external_squad: env.get(&key("EXTERNAL_SQUAD")),
            },
        });
    }
    TariffCatalog::new(tariffs)
}
