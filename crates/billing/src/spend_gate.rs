//! Spend gate for paid features
//!
//! Wraps a paid operation: resolve the user, refuse up front when the balance
//! cannot cover the cost, run the operation, and debit only when it succeeded
//! with a chargeable result. A failed operation never costs anything.

use std::future::Future;

use folio_shared::TransactionId;

use crate::balance::BalanceService;
use crate::error::BillingError;
use crate::users::{User, UserService};

/// Outcome of a paid operation, tagged with whether it should be billed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paid<T> {
    pub value: T,
    pub chargeable: bool,
}

impl<T> Paid<T> {
    /// Fresh work that costs the user tokens
    pub fn charge(value: T) -> Self {
        Self {
            value,
            chargeable: true,
        }
    }

    /// A result served without cost (e.g. from cache)
    pub fn free(value: T) -> Self {
        Self {
            value,
            chargeable: false,
        }
    }
}

/// Result of a gated operation
#[derive(Debug, Clone)]
pub struct Charged<T> {
    pub value: T,
    pub user: User,
    /// Debit entry, `None` when the result was free
    pub transaction_id: Option<TransactionId>,
    /// Balance after the (possible) debit
    pub balance: i64,
}

impl<T> Charged<T> {
    pub fn was_charged(&self) -> bool {
        self.transaction_id.is_some()
    }
}

/// Error from a gated operation: either billing refused or the operation failed
#[derive(Debug)]
pub enum SpendError<E> {
    Billing(BillingError),
    Operation(E),
}

impl<E> From<BillingError> for SpendError<E> {
    fn from(err: BillingError) -> Self {
        SpendError::Billing(err)
    }
}

impl<E: std::fmt::Display> std::fmt::Display for SpendError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpendError::Billing(e) => write!(f, "{}", e),
            SpendError::Operation(e) => write!(f, "paid operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for SpendError<E> {}

#[derive(Clone)]
pub struct SpendGate {
    users: UserService,
    balance: BalanceService,
}

impl SpendGate {
    pub fn new(users: UserService, balance: BalanceService) -> Self {
        Self { users, balance }
    }

    /// Run `op` on behalf of `device_id`, charging `cost` tokens on success.
    ///
    /// The pre-check is advisory; the debit itself re-checks under the user
    /// row lock. If a concurrent spend drained the balance while `op` was
    /// running, the debit is refused with `InsufficientFunds` and the result
    /// is discarded.
    pub async fn run<T, E, F, Fut>(
        &self,
        device_id: &str,
        cost: i64,
        description: &str,
        op: F,
    ) -> Result<Charged<T>, SpendError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Paid<T>, E>>,
        E: std::fmt::Display,
    {
        if cost <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "operation cost must be positive, got {}",
                cost
            ))
            .into());
        }

        let (user, _) = self.users.find_or_create(device_id).await?;

        let balance = self.balance.get_balance(user.id).await?;
        if balance < cost {
            tracing::info!(
                user_id = %user.id,
                balance = balance,
                required = cost,
                "Paid operation refused: insufficient funds"
            );
            return Err(BillingError::InsufficientFunds {
                balance,
                required: cost,
            }
            .into());
        }

        let paid = match op().await {
            Ok(paid) => paid,
            Err(e) => {
                tracing::warn!(
                    user_id = %user.id,
                    error = %e,
                    "Paid operation failed, nothing charged"
                );
                return Err(SpendError::Operation(e));
            }
        };

        if !paid.chargeable {
            tracing::debug!(user_id = %user.id, "Free result, nothing charged");
            return Ok(Charged {
                value: paid.value,
                user,
                transaction_id: None,
                balance,
            });
        }

        let debit = match self.balance.debit(user.id, cost, description).await {
            Ok(debit) => debit,
            Err(e @ BillingError::InsufficientFunds { .. }) => {
                tracing::warn!(
                    user_id = %user.id,
                    required = cost,
                    "Balance drained by a concurrent spend while the operation ran"
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Charged {
            value: paid.value,
            user,
            transaction_id: Some(debit.transaction_id),
            balance: debit.balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paid_constructors() {
        assert!(Paid::charge(1).chargeable);
        assert!(!Paid::free(1).chargeable);
    }

    #[test]
    fn test_spend_error_display() {
        let err: SpendError<String> = BillingError::InsufficientFunds {
            balance: 5,
            required: 10,
        }
        .into();
        assert_eq!(err.to_string(), "Insufficient funds: balance 5, required 10");

        let err: SpendError<String> = SpendError::Operation("provider down".to_string());
        assert_eq!(err.to_string(), "paid operation failed: provider down");
    }
}
