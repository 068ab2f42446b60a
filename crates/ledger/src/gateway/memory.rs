//! In-process provisioning gateway
//!
//! Keeps users in memory and counts create/extend calls. A failure can be
//! queued with [`InMemoryGateway::fail_next`] to exercise error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CreateUser, ExtendUser, GatewayError, GatewayResult, GatewayUser, ProvisioningGateway,
};

#[derive(Clone, Default)]
pub struct InMemoryGateway {
    users: Arc<Mutex<HashMap<String, GatewayUser>>>,
    pending_failure: Arc<Mutex<Option<GatewayError>>>,
    lookups: Arc<AtomicUsize>,
    creates: Arc<AtomicUsize>,
    extends: Arc<AtomicUsize>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next gateway call fail with `error`.
    pub async fn fail_next(&self, error: GatewayError) {
        *self.pending_failure.lock().await = Some(error);
    }

    /// Register a user as if an external actor had created it.
    pub async fn insert_user(&self, user: GatewayUser) {
        self.users.lock().await.insert(user.username.clone(), user);
    }

    pub async fn remove_user(&self, username: &str) -> Option<GatewayUser> {
        self.users.lock().await.remove(username)
    }

    pub async fn user(&self, username: &str) -> Option<GatewayUser> {
        self.users.lock().await.get(username).cloned()
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn extend_calls(&self) -> usize {
        self.extends.load(Ordering::SeqCst)
    }

    /// Total create and extend calls.
    pub fn mutating_calls(&self) -> usize {
        self.create_calls() + self.extend_calls()
    }

    async fn take_failure(&self) -> GatewayResult<()> {
        match self.pending_failure.lock().await.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn subscription_url(uuid: &str) -> String {
    format!("https://sub.local/{}", uuid)
}

#[async_trait]
impl ProvisioningGateway for InMemoryGateway {
    async fn lookup_by_username(&self, username: &str) -> GatewayResult<Option<GatewayUser>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;
        Ok(self.users.lock().await.get(username).cloned())
    }

    async fn create(&self, request: &CreateUser) -> GatewayResult<GatewayUser> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let mut users = self.users.lock().await;
        if users.contains_key(&request.username) {
            return Err(GatewayError::AlreadyExists(request.username.clone()));
        }

        let uuid = Uuid::new_v4().to_string();
        let user = GatewayUser {
            subscription_url: Some(subscription_url(&uuid)),
            uuid,
            username: request.username.clone(),
            expire_at: Some(request.expire_at),
        };
        users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn extend(&self, request: &ExtendUser) -> GatewayResult<GatewayUser> {
        self.extends.fetch_add(1, Ordering::SeqCst);
        self.take_failure().await?;

        let mut users = self.users.lock().await;
        let user = users
            .values_mut()
            .find(|u| u.uuid == request.uuid)
            .ok_or_else(|| GatewayError::Status {
                status: 404,
                body: format!("user {} not found", request.uuid),
            })?;
        user.expire_at = Some(request.expire_at);
        Ok(user.clone())
    }
}
