//! Scheduled job bodies
//!
//! Each job logs its own failures; a failed run waits for the next tick.

use myhealthguide_billing::BillingService;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Expire app-level trials that lapsed before now
///
/// Returns the number of users moved to `expired`.
pub async fn expire_trials(billing: &BillingService) -> usize {
    match billing.trials.expire_lapsed_trials(OffsetDateTime::now_utc()).await {
        Ok(sweep) => {
            if sweep.failed > 0 {
                warn!(
                    expired = sweep.expired.len(),
                    failed = sweep.failed,
                    "Trial expiry finished with failures"
                );
            } else {
                info!(expired = sweep.expired.len(), "Trial expiry complete");
            }
            sweep.expired.len()
        }
        Err(e) => {
            error!(error = %e, "Trial expiry sweep failed");
            0
        }
    }
}

/// Report agencies whose subscription block drifted from their super-admin
///
/// Returns the number of violations found.
pub async fn audit_agency_mirrors(billing: &BillingService) -> usize {
    match billing.audit.audit().await {
        Ok(violations) => {
            for violation in &violations {
                error!(
                    agency_id = %violation.agency_id,
                    user_id = %violation.super_admin_id,
                    fields = ?violation.fields,
                    "Agency mirror invariant violated"
                );
            }
            violations.len()
        }
        Err(e) => {
            error!(error = %e, "Agency mirror audit failed");
            0
        }
    }
}
