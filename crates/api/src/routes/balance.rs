//! Balance, pricing and ledger history routes

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use folio_billing::{PricingTier, TokenTransaction};
use folio_shared::UserId;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Query carrying the caller's device identifier
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQuery {
    pub device_id: Option<String>,
}

/// Pull a non-empty device id out of an optional field
pub(crate) fn require_device_id(device_id: Option<&str>) -> ApiResult<&str> {
    device_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("deviceId is required".to_string()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub balance: i64,
    pub user_id: UserId,
}

/// Current token balance; creates the user (with welcome bonus) on first contact
pub async fn get_balance(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<BalanceResponse>> {
    let device_id = require_device_id(query.device_id.as_deref())?;

    let (user, _) = state.billing.users.find_or_create(device_id).await?;
    let balance = state.billing.balance.get_balance(user.id).await?;

    Ok(Json(BalanceResponse {
        balance,
        user_id: user.id,
    }))
}

/// Published pricing tiers
pub async fn get_pricing(State(state): State<AppState>) -> Json<Vec<PricingTier>> {
    Json(state.billing.pricing().tiers().to_vec())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsQuery {
    pub device_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<TokenTransaction>,
}

/// Ledger entries for a device, newest first
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> ApiResult<Json<TransactionsResponse>> {
    let device_id = require_device_id(query.device_id.as_deref())?;

    // Unknown devices simply have no history yet.
    let Some(user) = state.billing.users.find_by_device(device_id).await? else {
        return Ok(Json(TransactionsResponse {
            transactions: Vec::new(),
        }));
    };

    let transactions = state
        .billing
        .balance
        .list_transactions(user.id, query.limit)
        .await?;

    Ok(Json(TransactionsResponse { transactions }))
}
