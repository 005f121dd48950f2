//! Payment sweeps
//!
//! Background passes over open payments: reconcile the ones whose webhook
//! never arrived, and expire the ones that stayed open too long. Errors are
//! logged, never returned, so one bad pass does not stop the scheduler.

use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use folio_billing::{BillingService, SweepSummary};

/// Runs sweeps, skipping a pass while the previous one is still going
pub struct PaymentSweeper {
    billing: BillingService,
    running: Mutex<()>,
}

impl PaymentSweeper {
    pub fn new(billing: BillingService) -> Self {
        Self {
            billing,
            running: Mutex::new(()),
        }
    }

    /// Poll open payments untouched for at least `min_age`
    pub async fn reconcile(&self, min_age: Duration) -> Option<SweepSummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous payment sweep still running, skipping reconcile pass");
            return None;
        };

        match self.billing.payments.reconcile_open_payments(min_age).await {
            Ok(summary) => {
                log_summary("reconcile", &summary);
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Failed to reconcile open payments");
                None
            }
        }
    }

    /// Expire payments older than the configured expiry window
    pub async fn expire(&self) -> Option<SweepSummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous payment sweep still running, skipping expiry pass");
            return None;
        };

        let max_age = self.billing.settings.payment_expiry;
        match self.billing.payments.expire_stale_payments(max_age).await {
            Ok(summary) => {
                log_summary("expiry", &summary);
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Failed to expire stale payments");
                None
            }
        }
    }
}

fn log_summary(pass: &'static str, summary: &SweepSummary) {
    if summary.checked == 0 {
        return; // Nothing open
    }
    if summary.errors > 0 {
        warn!(
            pass = pass,
            checked = summary.checked,
            changed = summary.changed,
            expired = summary.expired,
            errors = summary.errors,
            "Payment sweep finished with errors"
        );
    } else {
        info!(
            pass = pass,
            checked = summary.checked,
            changed = summary.changed,
            expired = summary.expired,
            "Payment sweep finished"
        );
    }
}
