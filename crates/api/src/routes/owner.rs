//! Owner and admin routes
//!
//! Every handler checks the caller's role through the ledger services, so a
//! plain agent gets `403 access_denied`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use resell_ledger::{AgentReport, DeletedAgent, ReconcileReport, Statement};
use resell_shared::{Agent, Client};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{auth::ChatUser, error::ApiResult, state::AppState};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub telegram_id: i64,
    #[serde(default)]
    pub name: String,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreditLimitRequest {
    pub credit_limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub is_active: bool,
}

#[derive(Debug, Serialize)]
pub struct ExpiringClient {
    pub client_id: i64,
    pub username: String,
    pub agent_id: i64,
    pub agent_telegram_id: i64,
    pub agent_active: bool,
    pub days_left: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

// =============================================================================
// Agents
// =============================================================================

pub async fn list_agents(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<AgentReport>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(state.reseller.agents.report(&principal).await?))
}

pub async fn register_agent(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Json(body): Json<RegisterAgentRequest>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    let principal = state.principal(&actor).await?;
    let agent = state
        .reseller
        .agents
        .register(
            &principal,
            body.telegram_id,
            &body.name,
            body.username.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn set_credit_limit(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(agent_id): Path<i64>,
    Json(body): Json<CreditLimitRequest>,
) -> ApiResult<Json<Agent>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(
        state
            .reseller
            .agents
            .set_credit_limit(&principal, agent_id, body.credit_limit)
            .await?,
    ))
}

pub async fn set_active(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(agent_id): Path<i64>,
    Json(body): Json<ActiveRequest>,
) -> ApiResult<Json<Agent>> {
    let principal = state.principal(&actor).await?;
    let agent = state
        .reseller
        .agents
        .set_active(&principal, agent_id, body.is_active)
        .await?;
    if !agent.is_active {
        state.reseller.sessions.reset(agent.telegram_id).await;
    }
    Ok(Json(agent))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(agent_id): Path<i64>,
) -> ApiResult<Json<DeletedAgent>> {
    let principal = state.principal(&actor).await?;
    let deleted = state
        .reseller
        .agents
        .delete_agent(&principal, agent_id)
        .await?;
    state
        .reseller
        .sessions
        .reset(deleted.agent.telegram_id)
        .await;
    Ok(Json(deleted))
}

pub async fn agent_statement(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(agent_id): Path<i64>,
) -> ApiResult<Json<Statement>> {
    let principal = state.principal(&actor).await?;
    principal.require_privileged()?;
    Ok(Json(state.reseller.ledger.statement(agent_id).await?))
}

// =============================================================================
// Clients
// =============================================================================

pub async fn delete_client(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(client_id): Path<i64>,
) -> ApiResult<Json<Client>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(
        state
            .reseller
            .agents
            .delete_client(&principal, client_id)
            .await?,
    ))
}

// =============================================================================
// Background jobs on demand
// =============================================================================

pub async fn reconcile(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<ReconcileReport>> {
    let principal = state.principal(&actor).await?;
    principal.require_privileged()?;
    tracing::info!(
        telegram_id = principal.agent.telegram_id,
        "Manual reconciliation requested"
    );
    Ok(Json(state.reseller.reconciler.run_once().await?))
}

/// Preview of the next expiry sweep
pub async fn expiring(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<Vec<ExpiringClient>>> {
    let principal = state.principal(&actor).await?;
    principal.require_privileged()?;

    let now = OffsetDateTime::now_utc();
    let rows = state.reseller.expiry.list_expiring(now).await?;
    Ok(Json(
        rows.into_iter()
            .map(|(client, agent)| ExpiringClient {
                client_id: client.id,
                days_left: resell_ledger::pricing::days_left(client.expires_at, now),
                username: client.username,
                agent_id: agent.id,
                agent_telegram_id: agent.telegram_id,
                agent_active: agent.is_active,
                expires_at: client.expires_at,
            })
            .collect(),
    ))
}
