//! Token pricing tiers
//!
//! An immutable table of `(id, tokens, price)` offerings. It is built once at
//! startup and handed to the payment orchestrator; nothing mutates it later.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// One purchasable offering. `price` is in whole roubles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub id: String,
    pub tokens: i64,
    pub price: i64,
}

impl PricingTier {
    fn new(id: &str, tokens: i64, price: i64) -> Self {
        Self {
            id: id.to_string(),
            tokens,
            price,
        }
    }
}

/// Read-only pricing table
#[derive(Debug, Clone)]
pub struct PricingTable {
    tiers: Arc<[PricingTier]>,
}

impl PricingTable {
    /// Build a table, rejecting duplicate ids and non-positive values
    pub fn new(tiers: Vec<PricingTier>) -> BillingResult<Self> {
        if tiers.is_empty() {
            return Err(BillingError::Config("pricing table is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for tier in &tiers {
            if tier.id.trim().is_empty() {
                return Err(BillingError::Config("pricing tier with empty id".to_string()));
            }
            if !seen.insert(tier.id.as_str()) {
                return Err(BillingError::Config(format!(
                    "duplicate pricing tier id: {}",
                    tier.id
                )));
            }
            if tier.tokens <= 0 || tier.price <= 0 {
                return Err(BillingError::Config(format!(
                    "pricing tier {} must have positive tokens and price",
                    tier.id
                )));
            }
        }

        Ok(Self {
            tiers: tiers.into(),
        })
    }

    /// Load from `PRICING_TIERS` (JSON array) or fall back to the built-in tiers
    pub fn from_env() -> BillingResult<Self> {
        match std::env::var("PRICING_TIERS") {
            Ok(raw) if !raw.trim().is_empty() => Self::from_json(&raw),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_json(raw: &str) -> BillingResult<Self> {
        let tiers: Vec<PricingTier> = serde_json::from_str(raw)
            .map_err(|e| BillingError::Config(format!("invalid PRICING_TIERS: {}", e)))?;
        Self::new(tiers)
    }

    pub fn tiers(&self) -> &[PricingTier] {
        &self.tiers
    }

    pub fn find(&self, tier_id: &str) -> Option<&PricingTier> {
        self.tiers.iter().find(|t| t.id == tier_id)
    }

    /// Find the tier offering exactly `tokens` for `price`
    pub fn find_matching(&self, tokens: i64, price: i64) -> Option<&PricingTier> {
        self.tiers
            .iter()
            .find(|t| t.tokens == tokens && t.price == price)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                PricingTier::new("tokens_300", 300, 99),
                PricingTier::new("tokens_1000", 1000, 300),
                PricingTier::new("tokens_3000", 3000, 790),
                PricingTier::new("tokens_10000", 10000, 2290),
            ]
            .into(),
        }
    }
}
