//! Super-admin to agency resolution

use std::sync::Arc;

use myhealthguide_shared::{AgencySubscription, UserId};

use crate::error::BillingResult;
use crate::store::BillingStore;

/// Finds the agency record, if any, that mirrors a user's subscription
#[derive(Clone)]
pub struct AgencyResolver {
    store: Arc<dyn BillingStore>,
}

impl AgencyResolver {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// The agency `user_id` is super-admin of
    ///
    /// Membership in an agency is not enough; only the super-admin's
    /// billing is mirrored.
    pub async fn mirrored_agency(&self, user_id: UserId) -> BillingResult<Option<AgencySubscription>> {
        let agency = self
            .store
            .agency_for_super_admin(user_id)
            .await?
            .filter(|agency| agency.super_admin_id == Some(user_id));

        if let Some(agency) = &agency {
            tracing::debug!(
                user_id = %user_id,
                agency_id = %agency.agency_id,
                "User is agency super-admin; billing will be mirrored"
            );
        }

        Ok(agency)
    }
}
