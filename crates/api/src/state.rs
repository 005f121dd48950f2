//! Shared application state

use folio_billing::BillingService;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::illustrations::IllustrationService;

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    pub illustrations: IllustrationService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        billing: BillingService,
        illustrations: IllustrationService,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
            illustrations,
        }
    }
}
