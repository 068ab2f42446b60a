// Ledger crate clippy configuration
#![allow(clippy::result_large_err)] // LedgerError carries gateway response bodies
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Resell Ledger
//!
//! Core of the reseller system: what agents owe the owner and how client
//! subscriptions are created and renewed against the provisioning gateway.
//!
//! ## Features
//!
//! - **Pricing**: prorated owner share, customer totals and upgrade corrections
//! - **Debt Ledger**: limit-checked debt changes with an insert-only audit trail
//! - **Transfers**: agent repayment claims approved or rejected once by the owner
//! - **Lifecycle**: the creation, renewal and repayment dialogues as explicit sessions
//! - **Gateway**: Remnawave HTTP client behind a provisioning trait
//! - **Reconciliation**: local subscriptions corrected from the gateway
//! - **Expiry Sweep**: agent notices for subscriptions about to expire
//! - **Invariants**: SQL consistency checks over the ledger

pub mod agents;
pub mod error;
pub mod expiry;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod pricing;
pub mod reconcile;
pub mod store;
pub mod transfers;

#[cfg(test)]
mod test_support;


// Agents
pub use agents::{Actor, AgentReport, AgentService, Principal, ReportSummary};

// Error
pub use error::{LedgerError, LedgerResult, ValidationError};

// Expiry
pub use expiry::{ExpiryNotice, ExpirySweeper, Notifier, NotifyError, SweepReport};

// Gateway
pub use gateway::{
    GatewayError, GatewayResult, GatewayUser, InMemoryGateway, ProvisioningGateway,
    RemnawaveGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{LedgerService, Statement};

// Lifecycle
pub use lifecycle::{
    CreationReceipt, Input, LifecycleEngine, Outcome, Prompt, RenewalReceipt, Session,
    SessionRegistry, StepResult,
};

// Pricing
pub use pricing::{CreationQuote, RenewalQuote};

// Reconciliation
pub use reconcile::{ReconcileReport, Reconciler};

// Store
pub use store::{AgentTx, DeletedAgent, MemoryStore, PgStore, Store, StoreError};

// Transfers
pub use transfers::{TransferDecision, TransferService};

use std::sync::Arc;

use resell_shared::Config;
use sqlx::PgPool;

/// Main service that wires every ledger component over one store and gateway
#[derive(Clone)]
pub struct ResellerService {
    pub config: Arc<Config>,
    pub agents: AgentService,
    pub engine: LifecycleEngine,
    pub sessions: SessionRegistry,
    pub ledger: LedgerService,
    pub transfers: TransferService,
    pub reconciler: Reconciler,
    pub expiry: ExpirySweeper,
}

impl ResellerService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn ProvisioningGateway>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            agents: AgentService::new(store.clone(), config.clone()),
            engine: LifecycleEngine::new(store.clone(), gateway.clone(), config.clone()),
            sessions: SessionRegistry::new(),
            ledger: LedgerService::new(store.clone()),
            transfers: TransferService::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), gateway),
            expiry: ExpirySweeper::new(store, &config),
            config,
        }
    }

    /// Production wiring: Postgres store and the Remnawave gateway
    pub fn connect(pool: PgPool, config: Arc<Config>) -> LedgerResult<Self> {
        let gateway = RemnawaveGateway::new(&config.gateway)?;
        Ok(Self::new(
            Arc::new(PgStore::new(pool)),
            Arc::new(gateway),
            config,
        ))
    }

    /// In-memory wiring for local runs and tests
    pub fn in_memory(config: Arc<Config>) -> (Self, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let service = Self::new(Arc::new(MemoryStore::new()), gateway.clone(), config);
        (service, gateway)
    }
}
