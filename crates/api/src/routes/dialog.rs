//! Dialogue and self-service routes

use axum::{extract::State, Json};
use resell_ledger::{Input, Principal, Session, Statement, StepResult};
use resell_shared::Client;

use crate::{auth::ChatUser, error::ApiResult, state::AppState};

/// Feed one input into the caller's dialogue
pub async fn step(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Json(input): Json<Input>,
) -> ApiResult<Json<StepResult>> {
    let principal = state.principal(&actor).await?;
    let result = state
        .reseller
        .sessions
        .dispatch(&state.reseller.engine, &principal, input)
        .await;
    Ok(Json(result))
}

/// The caller's current dialogue state
pub async fn current(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<Session>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(
        state
            .reseller
            .sessions
            .current(principal.agent.telegram_id)
            .await,
    ))
}

pub async fn me(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<Principal>> {
    Ok(Json(state.principal(&actor).await?))
}

pub async fn my_clients(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<Vec<Client>>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(state.reseller.agents.clients_of(&principal).await?))
}

/// Balance with the events and renewals that explain it
pub async fn my_statement(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
) -> ApiResult<Json<Statement>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(
        state.reseller.ledger.statement(principal.agent.id).await?,
    ))
}
