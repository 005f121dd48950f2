//! Folio billing core
//!
//! Token ledger, T-Bank top-up payments and the spend gate for paid features.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod balance;
pub mod client;
pub mod error;
pub mod payments;
pub mod pricing;
pub mod settings;
pub mod signature;
pub mod spend_gate;
pub mod users;

use sqlx::PgPool;
use std::sync::Arc;

pub use balance::{BalanceService, DebitOutcome, TokenTransaction};
pub use client::{PaymentGateway, TbankClient, TbankConfig};
pub use error::{BillingError, BillingResult};
pub use payments::{
    map_gateway_status, CreatedPayment, GatewaySignal, Payment, PaymentOrchestrator,
    ReconcileOutcome, ReconcileResult, ReportedAmount, SweepSummary,
};
pub use pricing::{PricingTable, PricingTier};
pub use settings::BillingSettings;
pub use spend_gate::{Charged, Paid, SpendError, SpendGate};
pub use users::{User, UserService};

/// Main billing service combining all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub users: UserService,
    pub balance: BalanceService,
    pub payments: PaymentOrchestrator,
    pub spend_gate: SpendGate,
    pub settings: BillingSettings,
}

impl BillingService {
    /// Wire the billing core around an arbitrary gateway implementation
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        pricing: PricingTable,
        settings: BillingSettings,
    ) -> Self {
        let users = UserService::new(pool.clone(), settings.welcome_bonus);
        let balance = BalanceService::new(pool.clone());
        let payments = PaymentOrchestrator::new(
            pool,
            gateway,
            balance.clone(),
            pricing,
            settings.poll_max_retries,
            settings.poll_base_delay,
        );
        let spend_gate = SpendGate::new(users.clone(), balance.clone());

        Self {
            users,
            balance,
            payments,
            spend_gate,
            settings,
        }
    }

    /// Build the billing core with the T-Bank client, reading all settings
    /// from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = TbankClient::from_env()?;
        let pricing = PricingTable::from_env()?;
        let settings = BillingSettings::from_env()?;

        tracing::info!(
            terminal_key = %gateway.config().terminal_key,
            api_url = %gateway.config().api_url,
            tiers = pricing.tiers().len(),
            "Billing configured"
        );

        Ok(Self::new(pool, Arc::new(gateway), pricing, settings))
    }

    pub fn pricing(&self) -> &PricingTable {
        self.payments.pricing()
    }
}
