//! Calls into the Stripe API
//!
//! The reconciler only needs three things from Stripe beyond the webhook
//! payload itself, so they sit behind [`StripeGateway`]. Production uses
//! [`StripeApiGateway`]; tests script the responses.

use async_trait::async_trait;
use stripe::{
    CancelSubscription, Subscription, SubscriptionId, SubscriptionSchedule,
    SubscriptionScheduleId, UpdateSubscription,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::unix_to_datetime;

/// The fields of a provider subscription the projector cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    /// Raw provider status, e.g. `"active"` or `"past_due"`
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
}

#[async_trait]
pub trait StripeGateway: Send + Sync {
    /// Price of the first schedule phase that has not started yet
    async fn upcoming_phase_price(&self, schedule_id: &str) -> BillingResult<Option<String>>;

    /// Toggle `cancel_at_period_end` on a subscription
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription>;

    /// Cancel a subscription immediately
    async fn cancel_now(&self, subscription_id: &str) -> BillingResult<()>;
}

/// Pick the price of the earliest phase starting after `now`
///
/// `phases` are `(start_date, first item price)` pairs in any order.
pub fn next_phase_price(phases: &[(i64, Option<String>)], now: i64) -> Option<String> {
    phases
        .iter()
        .filter(|(start, _)| *start > now)
        .min_by_key(|(start, _)| *start)
        .and_then(|(_, price)| price.clone())
}

/// [`StripeGateway`] backed by the Stripe REST API
#[derive(Clone)]
pub struct StripeApiGateway {
    stripe: StripeClient,
}

impl StripeApiGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }
}

#[async_trait]
impl StripeGateway for StripeApiGateway {
    async fn upcoming_phase_price(&self, schedule_id: &str) -> BillingResult<Option<String>> {
        let id = schedule_id
            .parse::<SubscriptionScheduleId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid schedule ID: {}", e)))?;

        let schedule = SubscriptionSchedule::retrieve(self.stripe.inner(), &id, &[]).await?;

        let phases: Vec<(i64, Option<String>)> = schedule
            .phases
            .iter()
            .map(|phase| {
                let price = phase.items.first().map(|item| item.price.id().to_string());
                (phase.start_date, price)
            })
            .collect();

        Ok(next_phase_price(
            &phases,
            OffsetDateTime::now_utc().unix_timestamp(),
        ))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::subscription_id(subscription_id)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };

        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        Ok(ProviderSubscription {
            id: subscription.id.to_string(),
            status: subscription.status.as_str().to_string(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            current_period_end: unix_to_datetime(subscription.current_period_end),
        })
    }

    async fn cancel_now(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = Self::subscription_id(subscription_id)?;
        Subscription::cancel(self.stripe.inner(), &sub_id, CancelSubscription::new()).await?;
        Ok(())
    }
}
