//! Application state

use std::sync::Arc;

use resell_ledger::{Actor, Principal, ResellerService};
use resell_shared::Config;

use crate::error::ApiResult;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub reseller: ResellerService,
    /// Shared secret expected in `X-Api-Key`
    pub api_key: Arc<str>,
}

impl AppState {
    pub fn new(reseller: ResellerService, api_key: &str) -> Self {
        Self {
            config: reseller.config.clone(),
            reseller,
            api_key: Arc::from(api_key),
        }
    }

    /// Resolve the acting chat user into a principal.
    pub async fn principal(&self, actor: &Actor) -> ApiResult<Principal> {
        Ok(self.reseller.agents.authenticate(actor).await?)
    }
}
