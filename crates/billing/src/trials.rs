//! App-level trial expiry
//!
//! Users who never attached a Stripe subscription hold a trial tracked only
//! by `trial_end_date`. Stripe sends no event when it lapses, so the worker
//! sweeps for them.

use std::sync::Arc;

use myhealthguide_shared::{SubscriptionStatus, UserId};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::projector::StateProjector;
use crate::store::{BillingStore, UserBillingUpdate};

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialSweep {
    pub expired: Vec<UserId>,
    pub failed: usize,
}

pub struct TrialExpiryService {
    store: Arc<dyn BillingStore>,
    projector: StateProjector,
}

impl TrialExpiryService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        let projector = StateProjector::new(store.clone());
        Self { store, projector }
    }

    /// Expire every app-level trial that ended before `now`
    ///
    /// One user's failure does not stop the sweep.
    pub async fn expire_lapsed_trials(&self, now: OffsetDateTime) -> BillingResult<TrialSweep> {
        let candidates = self.store.lapsed_trials(now).await?;
        let mut sweep = TrialSweep::default();

        for user_id in candidates {
            match self.expire_one(user_id, now).await {
                Ok(true) => sweep.expired.push(user_id),
                Ok(false) => {}
                Err(e) => {
                    sweep.failed += 1;
                    tracing::error!(user_id = %user_id, error = %e, "Failed to expire trial");
                }
            }
        }

        if !sweep.expired.is_empty() || sweep.failed > 0 {
            tracing::info!(
                expired = sweep.expired.len(),
                failed = sweep.failed,
                "Trial expiry sweep finished"
            );
        }

        Ok(sweep)
    }

    async fn expire_one(&self, user_id: UserId, now: OffsetDateTime) -> BillingResult<bool> {
        // A webhook may have attached a subscription since the candidate query
        let Some(user) = self.store.user_billing(user_id).await? else {
            return Ok(false);
        };
        let still_lapsed = user.subscription_status == SubscriptionStatus::Trial
            && user.stripe_subscription_id.is_none()
            && user.trial_end_date.is_some_and(|end| end < now);
        if !still_lapsed {
            return Ok(false);
        }

        self.projector
            .project(
                user_id,
                UserBillingUpdate {
                    subscription_status: Some(SubscriptionStatus::Expired),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(user_id = %user_id, "App-level trial expired");
        Ok(true)
    }
}
