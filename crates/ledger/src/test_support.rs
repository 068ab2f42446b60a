//! Fixtures shared by unit tests: owner 1, admin 2, base price 200, period 30.

use std::collections::HashMap;
use std::sync::Arc;

use resell_shared::Config;

use crate::agents::{Actor, AgentService, Principal};
use crate::gateway::InMemoryGateway;
use crate::lifecycle::{CreationReceipt, Input, LifecycleEngine, Outcome, Session, StepResult};
use crate::store::MemoryStore;

pub const OWNER: i64 = 1;
pub const ADMIN: i64 = 2;

pub fn config_with(pairs: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("DATABASE_URL", "postgres://localhost/resell_test"),
        ("REMNAWAVE_BASE_URL", "http://127.0.0.1:9"),
        ("REMNAWAVE_API_KEY", "test"),
        ("OWNER_TELEGRAM_ID", "1"),
        ("ADMIN_IDS", "2"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (key, value) in pairs {
        vars.insert(key.to_string(), value.to_string());
    }
    Config::from_lookup(move |key| vars.get(key).cloned()).unwrap()
}

pub fn test_config() -> Config {
    config_with(&[])
}

/// Basic 200, Premium 300 and a Private 100 tariff visible to agent 777 only.
pub fn tariff_config() -> Config {
    config_with(&[
        ("TARIFF_1_NAME", "Basic"),
        ("TARIFF_1_BASE_PRICE", "200"),
        ("TARIFF_2_NAME", "Premium"),
        ("TARIFF_2_BASE_PRICE", "300"),
        ("TARIFF_2_TRAFFIC_LIMIT_GB", "500"),
        ("TARIFF_3_NAME", "Private"),
        ("TARIFF_3_BASE_PRICE", "100"),
        ("TARIFF_3_AGENT_IDS", "777"),
    ])
}

pub fn actor(telegram_id: i64) -> Actor {
    Actor {
        telegram_id,
        name: format!("user {}", telegram_id),
        username: None,
    }
}

/// Engine wired to a memory store and an in-process gateway.
pub struct Harness {
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<InMemoryGateway>,
    pub agents: AgentService,
    pub engine: LifecycleEngine,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(InMemoryGateway::new());
        Self {
            agents: AgentService::new(store.clone(), config.clone()),
            engine: LifecycleEngine::new(store.clone(), gateway.clone(), config.clone()),
            config,
            store,
            gateway,
        }
    }

    pub async fn principal(&self, telegram_id: i64) -> Principal {
        self.agents.authenticate(&actor(telegram_id)).await.unwrap()
    }

    /// Register an agent with the given credit limit and authenticate it.
    pub async fn agent(&self, telegram_id: i64, credit_limit: i64) -> Principal {
        let owner = self.principal(OWNER).await;
        let agent = self
            .agents
            .register(&owner, telegram_id, "Agent", None)
            .await
            .unwrap();
        self.agents
            .set_credit_limit(&owner, agent.id, credit_limit)
            .await
            .unwrap();
        self.principal(telegram_id).await
    }

    /// Feed inputs one by one, re-authenticating before each step.
    pub async fn run(&self, telegram_id: i64, session: Session, inputs: Vec<Input>) -> StepResult {
        let mut result = StepResult {
            session,
            outcome: Outcome::Menu,
        };
        for input in inputs {
            let principal = self.principal(telegram_id).await;
            result = self
                .engine
                .step(&principal, result.session.clone(), input)
                .await;
        }
        result
    }

    /// Walk the whole creation dialogue and return the receipt.
    pub async fn create_client(
        &self,
        telegram_id: i64,
        username: &str,
        days: i64,
        tariff_id: Option<u32>,
        price: i64,
    ) -> CreationReceipt {
        let mut inputs = vec![Input::StartCreate, text(username), Input::PickDays { days }];
        if let Some(tariff_id) = tariff_id {
            inputs.push(Input::PickTariff { tariff_id });
        }
        inputs.extend([Input::PickPrice { price }, Input::Confirm]);

        match self.run(telegram_id, Session::Idle, inputs).await.outcome {
            Outcome::ClientCreated { receipt } => receipt,
            other => panic!("expected a created client, got {:?}", other),
        }
    }
}

pub fn text(value: &str) -> Input {
    Input::Text {
        text: value.to_string(),
    }
}
