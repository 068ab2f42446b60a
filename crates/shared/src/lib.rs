// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Resell Shared
//!
//! Types and infrastructure shared by the API server and the background worker:
//!
//! - **Configuration**: environment-driven [`Config`] loaded once at startup
//! - **Tariffs**: the operational tariff catalog and provisioning parameters
//! - **Models**: agent, client, debt event, renewal and transfer request rows
//! - **Database**: Postgres pool creation and embedded migrations

pub mod config;
pub mod db;
pub mod models;
pub mod tariff;

// Config
pub use config::{
    AgentDefaults, Config, ConfigError, GatewayConfig, GatewayMode, PricingConfig, Role,
    ScheduleConfig,
};

// Database
pub use db::{create_pool, run_migrations};

// Models
pub use models::{
    Agent, AgentOverview, Client, DebtEvent, NewAgent, NewClient, Renewal, RenewalUpdate,
    TransferRequest, TransferStatus,
};

// Tariffs
pub use tariff::{ProvisioningParams, Tariff, TariffCatalog, MAX_TARIFFS};
