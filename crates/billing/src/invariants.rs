//! Agency mirror audit
//!
//! An agency's subscription block must equal its super-admin's billing
//! fields. The audit only reports; repairs go through the next webhook.

use std::sync::Arc;

use myhealthguide_shared::{AgencyId, AgencySubscription, UserBilling, UserId};

use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorViolation {
    pub agency_id: AgencyId,
    pub super_admin_id: UserId,
    /// Names of the mirrored fields that disagree
    pub fields: Vec<&'static str>,
}

/// Fields where `agency` does not mirror `user`
pub fn diverging_fields(agency: &AgencySubscription, user: &UserBilling) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if agency.tier != user.subscription_tier {
        fields.push("tier");
    }
    if agency.status != Some(user.subscription_status) {
        fields.push("status");
    }
    if agency.stripe_customer_id != user.stripe_customer_id {
        fields.push("stripe_customer_id");
    }
    if agency.stripe_subscription_id != user.stripe_subscription_id {
        fields.push("stripe_subscription_id");
    }
    if agency.current_period_end != user.current_period_end {
        fields.push("current_period_end");
    }
    if agency.trial_ends_at != user.trial_end_date {
        fields.push("trial_ends_at");
    }
    fields
}

pub struct MirrorAuditor {
    store: Arc<dyn BillingStore>,
}

impl MirrorAuditor {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn audit(&self) -> BillingResult<Vec<MirrorViolation>> {
        let pairs = self.store.agency_mirror_pairs().await?;
        let checked = pairs.len();

        let violations: Vec<MirrorViolation> = pairs
            .into_iter()
            .filter_map(|(agency, user)| {
                let fields = diverging_fields(&agency, &user);
                if fields.is_empty() {
                    return None;
                }
                tracing::warn!(
                    agency_id = %agency.agency_id,
                    user_id = %user.user_id,
                    fields = ?fields,
                    "Agency subscription does not mirror super-admin billing"
                );
                Some(MirrorViolation {
                    agency_id: agency.agency_id,
                    super_admin_id: user.user_id,
                    fields,
                })
            })
            .collect();

        tracing::info!(
            checked = checked,
            violations = violations.len(),
            "Agency mirror audit finished"
        );

        Ok(violations)
    }
}
