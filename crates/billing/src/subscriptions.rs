//! Subscription management for the signed-in user
//!
//! Cancel and resume toggle `cancel_at_period_end` at Stripe first and then
//! project Stripe's answer locally, so a provider failure leaves local state
//! untouched.

use std::sync::Arc;

use myhealthguide_shared::{UserBilling, UserId};

use crate::error::{BillingError, BillingResult};
use crate::gateway::StripeGateway;
use crate::plans::map_provider_status;
use crate::projector::StateProjector;
use crate::store::{BillingStore, UserBillingUpdate};

pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn StripeGateway>,
    projector: StateProjector,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn StripeGateway>) -> Self {
        let projector = StateProjector::new(store.clone());
        Self {
            store,
            gateway,
            projector,
        }
    }

    /// Current billing projection of a user
    pub async fn get_subscription(&self, user_id: UserId) -> BillingResult<UserBilling> {
        self.store
            .user_billing(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    /// Cancel at the end of the current period
    pub async fn cancel_at_period_end(&self, user_id: UserId) -> BillingResult<UserBilling> {
        self.set_cancel_at_period_end(user_id, true).await
    }

    /// Undo a pending cancellation
    pub async fn resume(&self, user_id: UserId) -> BillingResult<UserBilling> {
        self.set_cancel_at_period_end(user_id, false).await
    }

    async fn set_cancel_at_period_end(
        &self,
        user_id: UserId,
        cancel: bool,
    ) -> BillingResult<UserBilling> {
        let user = self.get_subscription(user_id).await?;

        let subscription_id = user
            .stripe_subscription_id
            .clone()
            .filter(|_| user.subscription_status.is_live())
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound(format!("no active subscription for user {}", user_id))
            })?;

        let provider = self
            .gateway
            .set_cancel_at_period_end(&subscription_id, cancel)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    cancel = cancel,
                    error = %e,
                    "Stripe rejected cancel_at_period_end change"
                );
                e
            })?;

        let update = UserBillingUpdate {
            subscription_status: Some(map_provider_status(&provider.status)),
            cancel_at_period_end: Some(provider.cancel_at_period_end),
            current_period_end: provider.current_period_end.map(Some),
            ..Default::default()
        };

        self.projector.project(user_id, update).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            cancel_at_period_end = provider.cancel_at_period_end,
            "Subscription cancellation flag updated"
        );

        self.get_subscription(user_id).await
    }
}
