//! Device-keyed users
//!
//! Users are created lazily on first contact. Creation and the one-time
//! welcome bonus commit in a single transaction, and `ON CONFLICT DO NOTHING`
//! makes concurrent first contacts from one device converge on one row with
//! exactly one bonus.

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

use folio_shared::{TransactionKind, UserId};

use crate::balance::insert_entry;
use crate::error::{BillingError, BillingResult};

/// Device identifiers longer than this are rejected
pub const MAX_DEVICE_ID_LEN: usize = 255;

/// Default one-time grant for new users
pub const DEFAULT_WELCOME_BONUS: i64 = 300;

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub device_identity: String,
    pub display_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Validate and normalize a client-supplied device identifier
pub fn normalize_device_id(device_id: &str) -> BillingResult<&str> {
    let trimmed = device_id.trim();
    if trimmed.is_empty() {
        return Err(BillingError::InvalidInput("deviceId is required".to_string()));
    }
    if trimmed.len() > MAX_DEVICE_ID_LEN {
        return Err(BillingError::InvalidInput(format!(
            "deviceId must be at most {} characters",
            MAX_DEVICE_ID_LEN
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(BillingError::InvalidInput(
            "deviceId contains control characters".to_string(),
        ));
    }
    Ok(trimmed)
}

#[derive(Clone)]
pub struct UserService {
    pool: PgPool,
    welcome_bonus: i64,
}

impl UserService {
    pub fn new(pool: PgPool, welcome_bonus: i64) -> Self {
        Self {
            pool,
            welcome_bonus,
        }
    }

    /// Find the user for a device, creating it (with its welcome bonus) on
    /// first contact. Returns the user and whether it was just created.
    pub async fn find_or_create(&self, device_id: &str) -> BillingResult<(User, bool)> {
        let device_id = normalize_device_id(device_id)?;

        if let Some(user) = self.find_by_device(device_id).await? {
            return Ok((user, false));
        }

        let mut tx = self.pool.begin().await?;

        let inserted: Option<User> = sqlx::query_as(
            r#"
            INSERT INTO users (device_identity)
            VALUES ($1)
            ON CONFLICT (device_identity) DO NOTHING
            RETURNING id, device_identity, display_name, created_at
            "#,
        )
        .bind(device_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user) = inserted else {
            // Lost the race to a concurrent first contact; that request owns the bonus.
            tx.rollback().await?;
            let user = self
                .find_by_device(device_id)
                .await?
                .ok_or_else(|| BillingError::Internal(format!(
                    "user for device {} vanished after conflicting insert",
                    device_id
                )))?;
            return Ok((user, false));
        };

        if self.welcome_bonus > 0 {
            insert_entry(
                &mut tx,
                user.id,
                self.welcome_bonus,
                TransactionKind::Bonus,
                "Welcome bonus",
                None,
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %user.id,
            welcome_bonus = self.welcome_bonus,
            "Created user"
        );

        Ok((user, true))
    }

    pub async fn find_by_device(&self, device_id: &str) -> BillingResult<Option<User>> {
        let user: Option<User> = sqlx::query_as(
            r#"
            SELECT id, device_identity, display_name, created_at
            FROM users
            WHERE device_identity = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_device_id() {
        assert_eq!(normalize_device_id("  dev-1 ").unwrap(), "dev-1");
        assert!(matches!(
            normalize_device_id("   "),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(normalize_device_id(&"x".repeat(MAX_DEVICE_ID_LEN)).is_ok());
        assert!(normalize_device_id(&"x".repeat(MAX_DEVICE_ID_LEN + 1)).is_err());
        assert!(normalize_device_id("dev\u{0}1").is_err());
    }
}
