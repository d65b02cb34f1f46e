//! Plan-key resolution and provider status mapping

use std::collections::HashMap;

use myhealthguide_shared::{PlanTag, SubscriptionStatus};

use crate::client::StripeConfig;
use crate::events::metadata_plan;

/// Resolve the plan tag of a subscription
///
/// The price id is authoritative. Metadata (`planKey`, then `plan`) is only
/// consulted when the price is missing or not in the configured price table.
pub fn resolve_plan(
    config: &StripeConfig,
    price_id: Option<&str>,
    metadata: &HashMap<String, String>,
) -> Option<PlanTag> {
    if let Some(plan) = price_id.and_then(|id| config.plan_for_price_id(id)) {
        return Some(plan);
    }

    let fallback = metadata_plan(metadata);
    if fallback.is_none() {
        tracing::warn!(
            price_id = ?price_id,
            "Could not resolve plan tag from price or metadata; tier left unchanged"
        );
    }
    fallback
}

/// Map a Stripe subscription status onto the stored status
///
/// Delinquent subscriptions become `expired`, not `canceled`: only an explicit
/// deletion cancels.
pub fn map_provider_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trial,
        "canceled" => SubscriptionStatus::Canceled,
        "past_due" | "unpaid" => SubscriptionStatus::Expired,
        other => {
            tracing::debug!(status = %other, "Unmapped Stripe status treated as expired");
            SubscriptionStatus::Expired
        }
    }
}
