//! Token balance service
//!
//! The balance is never stored. It is always `SUM(amount)` over the user's
//! append-only `token_transactions` rows.
//!
//! Debits take a row lock on the owning `users` row for the duration of the
//! check-then-insert, so two concurrent debits for one user are serialized
//! and cannot both pass the sufficiency check.

use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;

use folio_shared::{TransactionId, TransactionKind, UserId};

use crate::error::{BillingError, BillingResult};

/// Default and maximum page size for ledger listings
pub const DEFAULT_TRANSACTIONS_LIMIT: i64 = 50;
pub const MAX_TRANSACTIONS_LIMIT: i64 = 100;

/// One immutable ledger entry
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub amount: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub description: String,
    /// Internal id of the payment that produced this entry
    pub payment_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of a successful debit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DebitOutcome {
    pub transaction_id: TransactionId,
    /// Balance right after the debit
    pub balance: i64,
}

/// Insert a single ledger row on an existing connection/transaction.
pub(crate) async fn insert_entry(
    conn: &mut PgConnection,
    user_id: UserId,
    amount: i64,
    kind: TransactionKind,
    description: &str,
    payment_ref: Option<i64>,
) -> Result<TransactionId, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO token_transactions (user_id, amount, type, description, payment_id)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .bind(kind)
    .bind(description)
    .bind(payment_ref)
    .fetch_one(&mut *conn)
    .await?;

    Ok(TransactionId(id))
}

/// Sum the ledger for one user on an existing connection/transaction
pub(crate) async fn sum_balance(conn: &mut PgConnection, user_id: UserId) -> Result<i64, sqlx::Error> {
    let (balance,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM token_transactions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(balance)
}

/// Balance service over the token ledger
#[derive(Clone)]
pub struct BalanceService {
    pool: PgPool,
}

impl BalanceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current balance; 0 for a user without ledger entries
    pub async fn get_balance(&self, user_id: UserId) -> BillingResult<i64> {
        let mut conn = self.pool.acquire().await?;
        Ok(sum_balance(&mut conn, user_id).await?)
    }

    /// Add tokens to a user's balance.
    ///
    /// Entries tied to a payment are recorded as `purchase`, everything else
    /// as `earn`.
    pub async fn credit(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
        payment_ref: Option<i64>,
    ) -> BillingResult<TransactionId> {
        let mut conn = self.pool.acquire().await?;
        self.credit_with_executor(&mut conn, user_id, amount, description, payment_ref)
            .await
    }

    /// Same as [`credit`](Self::credit) but on the caller's transaction, so the
    /// credit commits or rolls back together with the caller's other writes.
    pub async fn credit_with_executor(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        amount: i64,
        description: &str,
        payment_ref: Option<i64>,
    ) -> BillingResult<TransactionId> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                amount
            )));
        }

        let kind = if payment_ref.is_some() {
            TransactionKind::Purchase
        } else {
            TransactionKind::Earn
        };

        let id = insert_entry(conn, user_id, amount, kind, description, payment_ref).await?;

        tracing::info!(
            user_id = %user_id,
            transaction_id = %id,
            amount = amount,
            kind = %kind,
            payment_ref = ?payment_ref,
            "Tokens credited"
        );

        Ok(id)
    }

    /// Remove tokens if, and only if, the balance stays non-negative.
    ///
    /// On `InsufficientFunds` nothing is written.
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
    ) -> BillingResult<DebitOutcome> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "debit amount must be positive, got {}",
                amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        // Per-user critical section: held until commit/rollback.
        let locked: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }

        let balance = sum_balance(&mut tx, user_id).await?;
        if balance < amount {
            tx.rollback().await?;
            tracing::info!(
                user_id = %user_id,
                balance = balance,
                required = amount,
                "Debit refused: insufficient funds"
            );
            return Err(BillingError::InsufficientFunds {
                balance,
                required: amount,
            });
        }

        let transaction_id = insert_entry(
            &mut tx,
            user_id,
            -amount,
            TransactionKind::Spend,
            description,
            None,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            transaction_id = %transaction_id,
            amount = amount,
            balance = balance - amount,
            "Tokens debited"
        );

        Ok(DebitOutcome {
            transaction_id,
            balance: balance - amount,
        })
    }

    /// Ledger entries for a user, newest first
    pub async fn list_transactions(
        &self,
        user_id: UserId,
        limit: Option<i64>,
    ) -> BillingResult<Vec<TokenTransaction>> {
        let limit = clamp_limit(limit);
        let rows: Vec<TokenTransaction> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, type, description, payment_id, created_at
            FROM token_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Clamp a requested page size into `1..=MAX_TRANSACTIONS_LIMIT`
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_TRANSACTIONS_LIMIT)
        .clamp(1, MAX_TRANSACTIONS_LIMIT)
}
