//! Top-up payment orchestration
//!
//! Creates gateway checkout sessions and reconciles gateway status changes
//! into the ledger. Webhook callbacks, client-triggered polls and the
//! background sweeps all funnel into [`PaymentOrchestrator::reconcile`], which
//! is the single place a purchase credit can be written.
//!
//! ## Idempotency boundary
//!
//! `reconcile` locks the payment row (`SELECT ... FOR UPDATE`) and credits only
//! when the row moves into `completed` from any other status. A partial unique
//! index on `token_transactions(payment_id) WHERE type = 'purchase'` backs this
//! up at the schema level; a violation of it is treated as "already credited".
//! Replayed or concurrent callbacks yield at most one credit.
//!
//! ## Callback lookup policy
//!
//! 1. The gateway payment id is authoritative when present.
//! 2. Otherwise (or when no row carries that id yet) the local order id is used.
//! 3. When both ids are present they must agree with the row; a row whose
//!    stored ids contradict the callback is treated as not found.

use serde_json::Value;
use sqlx::{Connection, FromRow, PgPool};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use folio_shared::{PaymentStatus, TransactionId, UserId};

use crate::balance::BalanceService;
use crate::client::{json_id, GatewayState, PaymentGateway, SessionRequest};
use crate::error::{BillingError, BillingResult};
use crate::pricing::{PricingTable, PricingTier};

/// Upper bound for a single backoff delay while polling
const POLL_MAX_DELAY: Duration = Duration::from_secs(5);

/// How many stale payments one sweep looks at
pub const SWEEP_BATCH_SIZE: i64 = 100;

const PAYMENT_COLUMNS: &str = "id, user_id, amount, tokens_amount, payment_id, status, \
    gateway_payment_id, callback_raw, error_message, created_at, updated_at";

/// One top-up attempt
#[derive(Debug, Clone, FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: UserId,
    /// Fiat amount in whole roubles
    pub amount: i64,
    pub tokens_amount: i64,
    /// Locally generated id, sent to the gateway as the order id
    pub payment_id: String,
    pub status: PaymentStatus,
    pub gateway_payment_id: Option<String>,
    pub callback_raw: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    /// Expected amount in minor units (kopecks)
    pub fn amount_minor(&self) -> Option<i64> {
        self.amount.checked_mul(100)
    }
}

/// A freshly created payment plus the hosted checkout URL
#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub payment: Payment,
    pub payment_url: String,
}

/// `Amount` field of a gateway report, in minor units
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportedAmount {
    Missing,
    Minor(i64),
    /// Present but not an integer; completion is refused
    Unreadable(String),
}

impl ReportedAmount {
    /// Read `Amount` from a notification; the gateway may send it as a
    /// number or as a numeric string.
    pub fn from_payload(payload: &Value) -> Self {
        match payload.get("Amount") {
            None | Some(Value::Null) => Self::Missing,
            Some(value) => match json_id(value).and_then(|s| s.trim().parse::<i64>().ok()) {
                Some(amount) => Self::Minor(amount),
                None => Self::Unreadable(value.to_string()),
            },
        }
    }
}

impl From<Option<i64>> for ReportedAmount {
    fn from(amount: Option<i64>) -> Self {
        amount.map_or(Self::Missing, Self::Minor)
    }
}

/// A status report from the gateway, regardless of how it arrived
#[derive(Debug, Clone)]
pub struct GatewaySignal {
    pub status: String,
    pub gateway_payment_id: Option<String>,
    pub amount: ReportedAmount,
    pub raw: Value,
}

impl From<GatewayState> for GatewaySignal {
    fn from(state: GatewayState) -> Self {
        Self {
            status: state.status,
            gateway_payment_id: Some(state.gateway_payment_id),
            amount: state.amount_minor.into(),
            raw: state.raw,
        }
    }
}

/// What a reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Moved into `completed` and tokens were credited
    Credited { transaction_id: TransactionId },
    /// Moved to another status without touching the ledger
    Transitioned,
    /// Same status as before (e.g. a replayed callback)
    Unchanged,
    /// Gateway status outside the known vocabulary
    UnrecognizedStatus,
    /// Backward move or a move out of a terminal state; ignored
    IgnoredTransition,
}

#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub payment: Payment,
    pub previous_status: PaymentStatus,
    pub outcome: ReconcileOutcome,
}

/// Summary of a background sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub changed: usize,
    pub expired: usize,
    pub errors: usize,
}

/// Map the gateway's status vocabulary onto internal statuses.
/// `None` means the status is not recognized and must not cause a transition.
pub fn map_gateway_status(status: &str) -> Option<PaymentStatus> {
    match status {
        "NEW" | "FORM_SHOWED" => Some(PaymentStatus::Pending),
        "PREAUTHORIZING" | "AUTHORIZING" | "CONFIRMING" => Some(PaymentStatus::Processing),
        "CONFIRMED" | "AUTHORIZED" => Some(PaymentStatus::Completed),
        "REJECTED" | "AUTH_FAIL" => Some(PaymentStatus::Failed),
        "CANCELED" => Some(PaymentStatus::Cancelled),
        _ => None,
    }
}

/// Decide the status to store given the current one and a gateway report.
pub fn next_status(
    current: PaymentStatus,
    reported: Option<PaymentStatus>,
) -> (PaymentStatus, ReconcileOutcome) {
    match reported {
        None => (current, ReconcileOutcome::UnrecognizedStatus),
        Some(next) if next == current => (current, ReconcileOutcome::Unchanged),
        Some(next) if current.can_transition_to(next) => (next, ReconcileOutcome::Transitioned),
        Some(_) => (current, ReconcileOutcome::IgnoredTransition),
    }
}

/// Generate a local payment id: unix millis plus 32 random bits.
/// Unique in practice, not ordered across instances.
pub fn generate_order_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix: u32 = rand::random();
    format!("{}-{:08x}", millis, suffix)
}

/// Payment orchestrator
#[derive(Clone)]
pub struct PaymentOrchestrator {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    balance: BalanceService,
    pricing: PricingTable,
    poll_max_retries: usize,
    poll_base_delay: Duration,
}

impl PaymentOrchestrator {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        balance: BalanceService,
        pricing: PricingTable,
        poll_max_retries: usize,
        poll_base_delay: Duration,
    ) -> Self {
        Self {
            pool,
            gateway,
            balance,
            pricing,
            poll_max_retries,
            poll_base_delay,
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Resolve a purchase request to a published tier.
    ///
    /// Either `tier_id` is given, or `(tokens, amount)` must match a tier
    /// exactly; clients cannot invent their own price.
    pub fn resolve_tier(
        &self,
        tier_id: Option<&str>,
        tokens: Option<i64>,
        amount: Option<i64>,
    ) -> BillingResult<PricingTier> {
        if let Some(tier_id) = tier_id.map(str::trim).filter(|s| !s.is_empty()) {
            return self
                .pricing
                .find(tier_id)
                .cloned()
                .ok_or_else(|| BillingError::UnknownTier(tier_id.to_string()));
        }

        match (tokens, amount) {
            (Some(tokens), Some(amount)) => {
                if tokens <= 0 || amount <= 0 {
                    return Err(BillingError::InvalidAmount(
                        "tokensAmount and amount must be positive".to_string(),
                    ));
                }
                self.pricing
                    .find_matching(tokens, amount)
                    .cloned()
                    .ok_or_else(|| {
                        BillingError::UnknownTier(format!("{} tokens for {}", tokens, amount))
                    })
            }
            _ => Err(BillingError::InvalidInput(
                "either tierId or both tokensAmount and amount are required".to_string(),
            )),
        }
    }

    /// Create a payment and its hosted checkout session.
    ///
    /// The row is written as `pending` before the gateway is contacted; on
    /// success it moves to `processing`, on any gateway error (including
    /// timeout) it is marked `failed` and the error is returned.
    pub async fn create_payment(
        &self,
        user_id: UserId,
        tokens: i64,
        amount: i64,
    ) -> BillingResult<CreatedPayment> {
        if tokens <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "token quantity must be positive, got {}",
                tokens
            )));
        }
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }
        let amount_minor = amount.checked_mul(100).ok_or_else(|| {
            BillingError::InvalidAmount(format!("payment amount too large: {}", amount))
        })?;

        let order_id = generate_order_id();

        let payment: Payment = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments (user_id, amount, tokens_amount, payment_id, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(user_id)
        .bind(amount)
        .bind(tokens)
        .bind(&order_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            payment_id = %order_id,
            amount = amount,
            tokens = tokens,
            "Created pending payment"
        );

        let request = SessionRequest {
            order_id: order_id.clone(),
            amount_minor,
            description: format!("Folio: {} tokens", tokens),
        };

        let session = match self.gateway.init_session(&request).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    payment_id = %order_id,
                    error = %e,
                    "Gateway session creation failed, marking payment failed"
                );
                sqlx::query(
                    r#"
                    UPDATE payments
                    SET status = 'failed', error_message = $1, updated_at = NOW()
                    WHERE id = $2 AND status = 'pending'
                    "#,
                )
                .bind(e.to_string())
                .bind(payment.id)
                .execute(&self.pool)
                .await?;
                return Err(e);
            }
        };

        // A fast callback may already have moved the row; only promote `pending`.
        let payment: Payment = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET gateway_payment_id = COALESCE(gateway_payment_id, $1),
                status = CASE WHEN status = 'pending' THEN 'processing' ELSE status END,
                callback_raw = COALESCE(callback_raw, $2),
                updated_at = NOW()
            WHERE id = $3
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(&session.gateway_payment_id)
        .bind(&session.raw)
        .bind(payment.id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            payment_id = %payment.payment_id,
            gateway_payment_id = %session.gateway_payment_id,
            gateway_status = %session.status,
            status = %payment.status,
            "Gateway session created"
        );

        Ok(CreatedPayment {
            payment,
            payment_url: session.payment_url,
        })
    }

    /// Handle a gateway notification.
    ///
    /// Verification failures and unknown payments never change state. Callers
    /// should acknowledge the gateway regardless of the result.
    pub async fn handle_callback(&self, payload: &Value) -> BillingResult<ReconcileResult> {
        self.gateway.verify_notification(payload)?;

        let gateway_payment_id = payload.get("PaymentId").and_then(json_id);
        let order_id = payload
            .get("OrderId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        let status = payload
            .get("Status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BillingError::InvalidInput("callback without Status".to_string()))?;

        let payment = self
            .locate_for_callback(gateway_payment_id.as_deref(), order_id)
            .await?;

        tracing::info!(
            payment_id = %payment.payment_id,
            gateway_status = %status,
            "Processing gateway callback"
        );

        self.reconcile(
            payment.id,
            GatewaySignal {
                status: status.to_string(),
                gateway_payment_id,
                amount: ReportedAmount::from_payload(payload),
                raw: payload.clone(),
            },
        )
        .await
    }

    async fn locate_for_callback(
        &self,
        gateway_payment_id: Option<&str>,
        order_id: Option<&str>,
    ) -> BillingResult<Payment> {
        if let Some(gid) = gateway_payment_id {
            if let Some(payment) = self.find_by_gateway_id(gid).await? {
                if let Some(order_id) = order_id {
                    if order_id != payment.payment_id {
                        tracing::error!(
                            gateway_payment_id = %gid,
                            callback_order_id = %order_id,
                            stored_order_id = %payment.payment_id,
                            "Callback ids disagree with stored payment"
                        );
                        return Err(BillingError::PaymentNotFound(order_id.to_string()));
                    }
                }
                return Ok(payment);
            }
        }

        if let Some(order_id) = order_id {
            if let Some(payment) = self.find_by_order_id(order_id).await? {
                if let (Some(stored), Some(received)) =
                    (payment.gateway_payment_id.as_deref(), gateway_payment_id)
                {
                    if stored != received {
                        tracing::error!(
                            payment_id = %order_id,
                            stored_gateway_id = %stored,
                            callback_gateway_id = %received,
                            "Callback gateway id disagrees with stored payment"
                        );
                        return Err(BillingError::PaymentNotFound(order_id.to_string()));
                    }
                }
                return Ok(payment);
            }
        }

        let reference = gateway_payment_id
            .map(str::to_string)
            .or_else(|| order_id.map(str::to_string))
            .unwrap_or_else(|| "<none>".to_string());
        Err(BillingError::PaymentNotFound(reference))
    }

    /// Apply a gateway status report to one payment.
    ///
    /// The raw report is always stored for audit. The status only moves
    /// forward, and tokens are credited only on the move into `completed`.
    pub async fn reconcile(
        &self,
        payment_db_id: i64,
        signal: GatewaySignal,
    ) -> BillingResult<ReconcileResult> {
        let mut tx = self.pool.begin().await?;

        let current: Payment = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(payment_db_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BillingError::PaymentNotFound(payment_db_id.to_string()))?;

        let previous_status = current.status;
        let reported = map_gateway_status(&signal.status);
        let (mut next, mut outcome) = next_status(previous_status, reported);

        let mut refusal = None;
        if next == PaymentStatus::Completed && previous_status != PaymentStatus::Completed {
            refusal = match (&signal.amount, current.amount_minor()) {
                (ReportedAmount::Minor(received), Some(expected)) if *received != expected => {
                    Some(BillingError::AmountMismatch {
                        payment_id: current.payment_id.clone(),
                        expected,
                        received: *received,
                    })
                }
                (ReportedAmount::Unreadable(raw), _) => Some(BillingError::InvalidInput(format!(
                    "unreadable Amount {} for payment {}",
                    raw, current.payment_id
                ))),
                _ => None,
            };
            if refusal.is_some() {
                // Record the report but refuse to complete.
                next = previous_status;
                outcome = ReconcileOutcome::IgnoredTransition;
            }
        }

        let updated: Payment = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET status = $1,
                callback_raw = $2,
                gateway_payment_id = COALESCE(gateway_payment_id, $3),
                updated_at = NOW()
            WHERE id = $4
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(next)
        .bind(&signal.raw)
        .bind(signal.gateway_payment_id.as_deref())
        .bind(current.id)
        .fetch_one(&mut *tx)
        .await?;

        if next == PaymentStatus::Completed && previous_status != PaymentStatus::Completed {
            // Savepoint so a unique violation on the credit index leaves the
            // status update intact.
            let mut savepoint = tx.begin().await?;
            let credit = self
                .balance
                .credit_with_executor(
                    &mut savepoint,
                    current.user_id,
                    current.tokens_amount,
                    &format!(
                        "Purchase of {} tokens (order {})",
                        current.tokens_amount, current.payment_id
                    ),
                    Some(current.id),
                )
                .await;

            match credit {
                Ok(transaction_id) => {
                    savepoint.commit().await?;
                    outcome = ReconcileOutcome::Credited { transaction_id };
                }
                Err(BillingError::DuplicateCredit(_)) => {
                    savepoint.rollback().await?;
                    tracing::error!(
                        payment_id = %current.payment_id,
                        previous_status = %previous_status,
                        "Purchase credit already exists for a payment that was not completed"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().await?;

        match (&refusal, outcome) {
            (Some(err), _) => tracing::error!(error = %err, "Refusing to complete payment"),
            (None, ReconcileOutcome::Credited { transaction_id }) => tracing::info!(
                payment_id = %updated.payment_id,
                user_id = %updated.user_id,
                tokens = updated.tokens_amount,
                transaction_id = %transaction_id,
                "Payment completed and tokens credited"
            ),
            (None, ReconcileOutcome::UnrecognizedStatus) => tracing::warn!(
                payment_id = %updated.payment_id,
                gateway_status = %signal.status,
                "Unrecognized gateway status, payment left unchanged"
            ),
            (None, ReconcileOutcome::IgnoredTransition) => tracing::warn!(
                payment_id = %updated.payment_id,
                from = %previous_status,
                gateway_status = %signal.status,
                "Ignoring backward or post-terminal status report"
            ),
            (None, ReconcileOutcome::Transitioned) => tracing::info!(
                payment_id = %updated.payment_id,
                from = %previous_status,
                to = %updated.status,
                "Payment status changed"
            ),
            (None, ReconcileOutcome::Unchanged) => tracing::debug!(
                payment_id = %updated.payment_id,
                status = %updated.status,
                "Payment status unchanged"
            ),
        }

        if let Some(err) = refusal {
            return Err(err);
        }

        Ok(ReconcileResult {
            payment: updated,
            previous_status,
            outcome,
        })
    }

    /// Actively refresh a non-terminal payment from the gateway.
    ///
    /// Transient gateway failures are retried with exponential backoff. When
    /// retries run out the last stored status is returned unchanged.
    pub async fn poll_status(&self, order_id: &str) -> BillingResult<Payment> {
        let payment = self
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(order_id.to_string()))?;

        if payment.status.is_terminal() {
            return Ok(payment);
        }
        let Some(gateway_payment_id) = payment.gateway_payment_id.clone() else {
            return Ok(payment);
        };

        let state = match self.fetch_state_with_retry(&gateway_payment_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    payment_id = %payment.payment_id,
                    error = %e,
                    "Status poll failed, returning last known status"
                );
                return Ok(payment);
            }
        };

        match self.reconcile(payment.id, state.into()).await {
            Ok(result) => Ok(result.payment),
            Err(e @ (BillingError::AmountMismatch { .. } | BillingError::InvalidInput(_))) => {
                tracing::error!(
                    payment_id = %payment.payment_id,
                    error = %e,
                    "Polled status refused, returning stored payment"
                );
                Ok(self.find_by_order_id(order_id).await?.unwrap_or(payment))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_state_with_retry(&self, gateway_payment_id: &str) -> BillingResult<GatewayState> {
        let base_millis = u64::try_from(self.poll_base_delay.as_millis()).unwrap_or(u64::MAX).max(1);
        let retry_strategy = ExponentialBackoff::from_millis(base_millis)
            .max_delay(POLL_MAX_DELAY)
            .take(self.poll_max_retries)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.gateway.get_state(gateway_payment_id).await;
            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        gateway_payment_id = %gateway_payment_id,
                        error = %e,
                        "Transient gateway error - will retry"
                    );
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    pub async fn find_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    pub async fn find_by_gateway_id(&self, gateway_payment_id: &str) -> BillingResult<Option<Payment>> {
        let payment: Option<Payment> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE gateway_payment_id = $1 ORDER BY id DESC LIMIT 1",
            PAYMENT_COLUMNS
        ))
        .bind(gateway_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn open_payments(&self, older_than: Duration, limit: i64) -> BillingResult<Vec<Payment>> {
        let payments: Vec<Payment> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM payments
            WHERE status IN ('pending', 'processing')
              AND updated_at < NOW() - make_interval(secs => $1)
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(older_than.as_secs_f64())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    /// Poll open payments that have not moved for `min_age`, so payments
    /// whose webhook never arrived still get reconciled.
    pub async fn reconcile_open_payments(&self, min_age: Duration) -> BillingResult<SweepSummary> {
        let mut summary = SweepSummary::default();

        for payment in self.open_payments(min_age, SWEEP_BATCH_SIZE).await? {
            let Some(gateway_payment_id) = payment.gateway_payment_id.as_deref() else {
                continue;
            };
            summary.checked += 1;

            let state = match self.gateway.get_state(gateway_payment_id).await {
                Ok(state) => state,
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(
                        payment_id = %payment.payment_id,
                        error = %e,
                        "Reconciliation poll failed"
                    );
                    continue;
                }
            };

            match self.reconcile(payment.id, state.into()).await {
                Ok(result) if result.payment.status != result.previous_status => summary.changed += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(
                        payment_id = %payment.payment_id,
                        error = %e,
                        "Reconciliation failed"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Expire payments that stayed open longer than `max_age`.
    ///
    /// Each candidate gets one final gateway poll first. Payments the gateway
    /// still reports as open, and payments that never got a gateway session,
    /// are marked `failed`. A failed final poll leaves the payment for the
    /// next sweep rather than guessing.
    pub async fn expire_stale_payments(&self, max_age: Duration) -> BillingResult<SweepSummary> {
        let mut summary = SweepSummary::default();

        let stale: Vec<Payment> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM payments
            WHERE status IN ('pending', 'processing')
              AND created_at < NOW() - make_interval(secs => $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(max_age.as_secs_f64())
        .bind(SWEEP_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        for payment in stale {
            summary.checked += 1;

            if let Some(gateway_payment_id) = payment.gateway_payment_id.as_deref() {
                let state = match self.gateway.get_state(gateway_payment_id).await {
                    Ok(state) => state,
                    Err(e) => {
                        summary.errors += 1;
                        tracing::warn!(
                            payment_id = %payment.payment_id,
                            error = %e,
                            "Final poll before expiry failed, will retry next sweep"
                        );
                        continue;
                    }
                };

                match self.reconcile(payment.id, state.into()).await {
                    Ok(result) if result.payment.status.is_terminal() => {
                        summary.changed += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        summary.errors += 1;
                        tracing::error!(
                            payment_id = %payment.payment_id,
                            error = %e,
                            "Final reconciliation before expiry failed"
                        );
                        continue;
                    }
                }
            }

            let expired = sqlx::query(
                r#"
                UPDATE payments
                SET status = 'failed',
                    error_message = $1,
                    updated_at = NOW()
                WHERE id = $2 AND status IN ('pending', 'processing')
                "#,
            )
            .bind(format!(
                "expired after {} without a terminal gateway status",
                describe_age(max_age)
            ))
            .bind(payment.id)
            .execute(&self.pool)
            .await?;

            if expired.rows_affected() > 0 {
                summary.expired += 1;
                tracing::info!(
                    payment_id = %payment.payment_id,
                    previous_status = %payment.status,
                    "Expired stale payment"
                );
            }
        }

        Ok(summary)
    }
}

/// Human-readable age for status notes, in the largest whole unit
fn describe_age(age: Duration) -> String {
    let secs = age.as_secs();
    let (value, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if value == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", value, unit)
    }
}
