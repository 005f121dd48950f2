//! API error types and handling

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use folio_billing::{BillingError, SpendError};
use serde_json::json;

use crate::illustrations::ImageProviderError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Payment not found")]
    PaymentNotFound,

    // Billing errors
    #[error("Insufficient tokens")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    // Upstream glue
    #[error("Image generation failed: {0}")]
    ImageProvider(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::PaymentNotFound => (StatusCode::NOT_FOUND, "PAYMENT_NOT_FOUND", self.to_string()),

            // Billing
            ApiError::InsufficientFunds { balance, required } => {
                let body = Json(json!({
                    "error": {
                        "code": "INSUFFICIENT_FUNDS",
                        "message": self.to_string(),
                    },
                    "balance": balance,
                    "required": required,
                }));
                return (StatusCode::PAYMENT_REQUIRED, body).into_response();
            }
            ApiError::Gateway(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "GATEWAY_ERROR", msg.clone()),

            ApiError::ImageProvider(msg) => (StatusCode::BAD_GATEWAY, "IMAGE_PROVIDER_ERROR", msg.clone()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidAmount(msg)
            | BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::UnknownTier(tier) => {
                ApiError::Validation(format!("Unknown pricing tier: {}", tier))
            }
            BillingError::InsufficientFunds { balance, required } => {
                ApiError::InsufficientFunds { balance, required }
            }
            BillingError::PaymentNotFound(_) => ApiError::PaymentNotFound,
            BillingError::UserNotFound(_) => ApiError::NotFound,
            BillingError::InvalidSignature => {
                ApiError::BadRequest("Invalid signature".to_string())
            }
            BillingError::AmountMismatch { .. } => {
                ApiError::BadRequest("Payment amount mismatch".to_string())
            }
            e @ (BillingError::Gateway(_)
            | BillingError::GatewayTimeout
            | BillingError::GatewayRejected { .. }) => {
                tracing::warn!(error = %e, "Payment gateway error");
                ApiError::Gateway(e.to_string())
            }
            BillingError::Database(msg) | BillingError::DuplicateCredit(msg) => {
                tracing::error!(error = %msg, "Billing database error");
                ApiError::Database(msg)
            }
            e @ (BillingError::Config(_) | BillingError::Internal(_)) => {
                tracing::error!(error = %e, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

impl From<SpendError<ImageProviderError>> for ApiError {
    fn from(err: SpendError<ImageProviderError>) -> Self {
        match err {
            SpendError::Billing(e) => e.into(),
            SpendError::Operation(ImageProviderError::NotConfigured) => ApiError::ServiceUnavailable,
            SpendError::Operation(e) => ApiError::ImageProvider(e.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_insufficient_funds_response() {
        let err: ApiError = BillingError::InsufficientFunds {
            balance: 5,
            required: 10,
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response).await;
        assert_eq!(body["balance"], 5);
        assert_eq!(body["required"], 10);
        assert_eq!(body["error"]["code"], "INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn test_billing_error_status_mapping() {
        let cases = [
            (BillingError::InvalidAmount("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::UnknownTier("gold".into()), StatusCode::BAD_REQUEST),
            (BillingError::PaymentNotFound("1-a".into()), StatusCode::NOT_FOUND),
            (BillingError::InvalidSignature, StatusCode::BAD_REQUEST),
            (BillingError::GatewayTimeout, StatusCode::INTERNAL_SERVER_ERROR),
            (BillingError::Database("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_gateway_message_is_surfaced_database_is_not() {
        let body = body_json(
            ApiError::from(BillingError::GatewayRejected {
                code: "9999".into(),
                message: "terminal blocked".into(),
            })
            .into_response(),
        )
        .await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("terminal blocked"));

        let body = body_json(
            ApiError::from(BillingError::Database("password=hunter2".into())).into_response(),
        )
        .await;
        assert_eq!(body["error"]["message"], "Database error");
    }
}
