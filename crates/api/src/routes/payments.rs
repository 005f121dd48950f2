//! Top-up payment routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;

use folio_billing::{BillingError, Payment};
use folio_shared::PaymentStatus;

use crate::{
    error::ApiResult,
    routes::balance::require_device_id,
    state::AppState,
};

/// Request to start a top-up
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub device_id: Option<String>,
    pub tier_id: Option<String>,
    pub tokens_amount: Option<i64>,
    pub amount: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentResponse {
    pub payment_id: String,
    pub payment_url: String,
    pub order_id: String,
    pub amount: i64,
    pub tokens_amount: i64,
    pub status: PaymentStatus,
}

/// Create a payment for a pricing tier and return the hosted checkout URL
pub async fn create_payment(
    State(state): State<AppState>,
    body: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> ApiResult<Json<CreatePaymentResponse>> {
    let Json(req) = body?;
    let device_id = require_device_id(req.device_id.as_deref())?;

    let tier = state
        .billing
        .payments
        .resolve_tier(req.tier_id.as_deref(), req.tokens_amount, req.amount)?;

    let (user, _) = state.billing.users.find_or_create(device_id).await?;

    let created = state
        .billing
        .payments
        .create_payment(user.id, tier.tokens, tier.price)
        .await?;

    tracing::info!(
        user_id = %user.id,
        payment_id = %created.payment.payment_id,
        tier = %tier.id,
        "Top-up started"
    );

    Ok(Json(CreatePaymentResponse {
        payment_id: created.payment.payment_id.clone(),
        payment_url: created.payment_url,
        order_id: created.payment.payment_id,
        amount: created.payment.amount,
        tokens_amount: created.payment.tokens_amount,
        status: created.payment.status,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub payment_id: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub tokens_amount: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Payment> for PaymentStatusResponse {
    fn from(payment: Payment) -> Self {
        Self {
            payment_id: payment.payment_id,
            status: payment.status,
            amount: payment.amount,
            tokens_amount: payment.tokens_amount,
            created_at: payment.created_at.format(&Rfc3339).unwrap_or_default(),
            updated_at: payment.updated_at.format(&Rfc3339).unwrap_or_default(),
        }
    }
}

/// Payment status; refreshes from the gateway while the payment is open
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> ApiResult<Json<PaymentStatusResponse>> {
    let payment = state
        .billing
        .payments
        .poll_status(&payment_id)
        .await?;

    Ok(Json(payment.into()))
}

/// Gateway notification endpoint.
///
/// Always answers `200 OK` so the gateway stops redelivering; rejected and
/// failed notifications are logged and leave state untouched.
pub async fn tbank_callback(State(state): State<AppState>, body: String) -> (StatusCode, &'static str) {
    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(body_len = body.len(), error = %e, "Unparseable gateway notification");
            return (StatusCode::OK, "OK");
        }
    };

    match state.billing.payments.handle_callback(&payload).await {
        Ok(result) => {
            tracing::info!(
                payment_id = %result.payment.payment_id,
                status = %result.payment.status,
                outcome = ?result.outcome,
                "Gateway notification processed"
            );
        }
        Err(e @ (BillingError::InvalidSignature | BillingError::PaymentNotFound(_))) => {
            tracing::warn!(error = %e, "Gateway notification rejected");
        }
        Err(e) => {
            tracing::error!(error = %e, "Gateway notification processing failed");
        }
    }

    (StatusCode::OK, "OK")
}
