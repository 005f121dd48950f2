//! Paid illustration endpoint

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    illustrations::validate_request,
    routes::balance::require_device_id,
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateIllustrationRequest {
    pub device_id: Option<String>,
    pub passage: String,
    pub style: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateIllustrationResponse {
    pub image_url: String,
    pub cached: bool,
    pub provider: String,
    /// Tokens charged for this request (0 for cache hits)
    pub cost: i64,
    pub balance: i64,
}

/// Generate an illustration for a passage, charging the device's balance
pub async fn generate_illustration(
    State(state): State<AppState>,
    body: Result<Json<GenerateIllustrationRequest>, JsonRejection>,
) -> ApiResult<Json<GenerateIllustrationResponse>> {
    let Json(req) = body?;
    let device_id = require_device_id(req.device_id.as_deref())?;
    validate_request(&req.passage, req.style.as_deref()).map_err(ApiError::Validation)?;

    let charged = state
        .illustrations
        .generate(
            &state.billing.spend_gate,
            device_id,
            &req.passage,
            req.style.as_deref(),
        )
        .await?;

    let cost = if charged.was_charged() {
        state.illustrations.cost()
    } else {
        0
    };

    Ok(Json(GenerateIllustrationResponse {
        image_url: charged.value.image_url,
        cached: charged.value.cached,
        provider: charged.value.provider,
        cost,
        balance: charged.balance,
    }))
}
