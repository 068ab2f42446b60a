use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{Input, LifecycleEngine, Session, StepResult};
use crate::agents::Principal;

/// Per-user sessions. Each user has its own lock, so at most one step per
/// user is in flight while different users proceed independently. Only users
/// in the middle of a flow keep an entry.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<i64, Arc<Mutex<Session>>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, telegram_id: i64) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(telegram_id).or_default().clone()
    }

    pub async fn current(&self, telegram_id: i64) -> Session {
        let slot = self.sessions.lock().await.get(&telegram_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.clone(),
            None => Session::Idle,
        }
    }

    /// Run one step against the user's stored session and keep the result.
    pub async fn dispatch(
        &self,
        engine: &LifecycleEngine,
        principal: &Principal,
        input: Input,
    ) -> StepResult {
        let telegram_id = principal.agent.telegram_id;
        let slot = self.slot(telegram_id).await;
        let mut session = slot.lock().await;
        let result = engine.step(principal, session.clone(), input).await;
        *session = result.session.clone();

        if *session == Session::Idle {
            let mut sessions = self.sessions.lock().await;
            // Keep the slot while another step for this user waits on it
            if Arc::strong_count(&slot) == 2 {
                sessions.remove(&telegram_id);
            }
        }
        result
    }

    /// Drop the user's dialogue, e.g. once the agent is deactivated or deleted.
    pub async fn reset(&self, telegram_id: i64) {
        let slot = self.sessions.lock().await.remove(&telegram_id);
        if let Some(slot) = slot {
            *slot.lock().await = Session::Idle;
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
