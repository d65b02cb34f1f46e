//! State projector
//!
//! Turns a set of absolute user billing values into one atomic batch that
//! also carries the agency mirror when the user is a super-admin.

use std::sync::Arc;

use myhealthguide_shared::{AgencyId, UserId};

use crate::agency::AgencyResolver;
use crate::error::BillingResult;
use crate::store::{AgencySubscriptionUpdate, BillingStore, BillingWriteBatch, UserBillingUpdate};

/// What a committed projection touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub user_id: UserId,
    /// Set when the agency mirror was written in the same batch
    pub agency_id: Option<AgencyId>,
}

#[derive(Clone)]
pub struct StateProjector {
    store: Arc<dyn BillingStore>,
    agencies: AgencyResolver,
}

impl StateProjector {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        let agencies = AgencyResolver::new(store.clone());
        Self { store, agencies }
    }

    /// Build the batch for `update` without committing it
    pub async fn batch_for(
        &self,
        user_id: UserId,
        update: UserBillingUpdate,
    ) -> BillingResult<(BillingWriteBatch, Option<AgencyId>)> {
        let mirror = AgencySubscriptionUpdate::mirror_of(&update);
        let mut batch = BillingWriteBatch::new().update_user(user_id, update);
        let mut agency_id = None;

        if !mirror.is_empty() {
            if let Some(agency) = self.agencies.mirrored_agency(user_id).await? {
                batch = batch.update_agency(agency.agency_id, mirror);
                agency_id = Some(agency.agency_id);
            }
        }

        Ok((batch, agency_id))
    }

    /// Write `update` to the user and its agency mirror atomically
    pub async fn project(
        &self,
        user_id: UserId,
        update: UserBillingUpdate,
    ) -> BillingResult<Projection> {
        let (batch, agency_id) = self.batch_for(user_id, update).await?;
        self.store.commit(batch).await?;

        tracing::info!(
            user_id = %user_id,
            agency_id = ?agency_id,
            "Billing state projected"
        );

        Ok(Projection { user_id, agency_id })
    }
}
