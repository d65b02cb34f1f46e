//! Account deletion
//!
//! Billing must stop before the user record goes away: any Stripe
//! subscription not already canceled is cancelled first and a failure there
//! aborts the deletion.
//! The confirmation email goes out after the commit and its outcome never
//! changes the result.

use std::sync::Arc;

use myhealthguide_shared::{AgencyId, SubscriptionStatus, UserId};

use crate::agency::AgencyResolver;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::StripeGateway;
use crate::store::{AgencySubscriptionUpdate, BillingStore, BillingWriteBatch};

/// Summary of a completed deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDeletion {
    pub user_id: UserId,
    /// Stripe subscription cancelled as part of the deletion
    pub canceled_subscription_id: Option<String>,
    /// Agency whose subscription was marked canceled
    pub agency_id: Option<AgencyId>,
    pub email_sent: bool,
}

pub struct AccountDeletionService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn StripeGateway>,
    agencies: AgencyResolver,
    email: BillingEmailService,
}

impl AccountDeletionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn StripeGateway>,
        email: BillingEmailService,
    ) -> Self {
        let agencies = AgencyResolver::new(store.clone());
        Self {
            store,
            gateway,
            agencies,
            email,
        }
    }

    pub async fn delete_account(&self, user_id: UserId) -> BillingResult<AccountDeletion> {
        let user = self
            .store
            .user_billing(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        // Expired covers past_due and unpaid, which Stripe keeps retrying
        let canceled_subscription_id = match &user.stripe_subscription_id {
            Some(subscription_id) if user.subscription_status != SubscriptionStatus::Canceled => {
                self.gateway.cancel_now(subscription_id).await.map_err(|e| {
                    tracing::error!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to cancel subscription; account not deleted"
                    );
                    e
                })?;
                Some(subscription_id.clone())
            }
            _ => None,
        };

        let mut batch = BillingWriteBatch::new();
        let agency_id = match self.agencies.mirrored_agency(user_id).await? {
            Some(agency) => {
                batch = batch.update_agency(
                    agency.agency_id,
                    AgencySubscriptionUpdate {
                        status: Some(SubscriptionStatus::Canceled),
                        ..Default::default()
                    },
                );
                Some(agency.agency_id)
            }
            None => None,
        };
        batch = batch.delete_user(user_id);

        self.store.commit(batch).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = ?canceled_subscription_id,
            agency_id = ?agency_id,
            "Account deleted"
        );

        let email_sent = self
            .email
            .send_account_deleted(&user.email, user.name.as_deref())
            .await
            .unwrap_or(false);

        Ok(AccountDeletion {
            user_id,
            canceled_subscription_id,
            agency_id,
            email_sent,
        })
    }
}
