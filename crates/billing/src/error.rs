//! Billing error types

use folio_shared::db::is_unique_violation;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown pricing tier: {0}")]
    UnknownTier(String),

    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: i64, required: i64 },

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Callback signature verification failed")]
    InvalidSignature,

    #[error("Callback amount mismatch for payment {payment_id}: expected {expected}, got {received}")]
    AmountMismatch {
        payment_id: String,
        expected: i64,
        received: i64,
    },

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment gateway timed out")]
    GatewayTimeout,

    #[error("Payment gateway rejected request ({code}): {message}")]
    GatewayRejected { code: String, message: String },

    /// A purchase credit already exists for this payment
    #[error("Purchase credit already recorded for payment {0}")]
    DuplicateCredit(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Transient failures are worth retrying (network trouble, timeouts).
    /// Explicit gateway rejections and local validation errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::GatewayTimeout | BillingError::Gateway(_))
    }
}

/// Partial unique index allowing one purchase credit per payment
pub const PURCHASE_CREDIT_INDEX: &str = "token_transactions_purchase_payment_key";

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err, Some(PURCHASE_CREDIT_INDEX)) {
            return BillingError::DuplicateCredit(err.to_string());
        }
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::GatewayTimeout
        } else {
            BillingError::Gateway(err.to_string())
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
