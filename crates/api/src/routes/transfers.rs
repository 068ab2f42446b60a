//! Repayment request routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use resell_ledger::TransferDecision;
use resell_shared::{TransferRequest, TransferStatus};
use serde::Deserialize;

use crate::{
    auth::ChatUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransferListQuery {
    pub status: Option<TransferStatus>,
}

pub async fn create(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Json(body): Json<CreateTransferRequest>,
) -> ApiResult<(StatusCode, Json<TransferRequest>)> {
    let principal = state.principal(&actor).await?;
    let request = state
        .reseller
        .transfers
        .request(&principal, body.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn approve(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(request_id): Path<i64>,
) -> ApiResult<Json<TransferDecision>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(
        state.reseller.transfers.approve(&principal, request_id).await?,
    ))
}

pub async fn reject(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Path(request_id): Path<i64>,
) -> ApiResult<Json<TransferDecision>> {
    let principal = state.principal(&actor).await?;
    Ok(Json(
        state.reseller.transfers.reject(&principal, request_id).await?,
    ))
}

/// Requests awaiting the owner's decision. Only `status=pending` is listable.
pub async fn list(
    State(state): State<AppState>,
    ChatUser(actor): ChatUser,
    Query(query): Query<TransferListQuery>,
) -> ApiResult<Json<Vec<TransferRequest>>> {
    if !matches!(query.status, None | Some(TransferStatus::Pending)) {
        return Err(ApiError::BadRequest(
            "only pending transfer requests can be listed".to_string(),
        ));
    }
    let principal = state.principal(&actor).await?;
    Ok(Json(state.reseller.transfers.pending(&principal).await?))
}
