//! In-memory [`BillingStore`]
//!
//! Holds users, agencies and the event ledger behind one lock so a batch is
//! applied atomically. Every committed batch is kept so callers can assert on
//! exactly what was written.

use std::collections::HashMap;

use async_trait::async_trait;
use myhealthguide_shared::{AgencyId, AgencySubscription, SubscriptionStatus, UserBilling, UserId};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::store::{
    BillingStore, BillingWrite, BillingWriteBatch, EventClaim, EventOutcome,
    PROCESSING_TIMEOUT_MINUTES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerStatus {
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    status: LedgerStatus,
    started_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, UserBilling>,
    agencies: HashMap<AgencyId, AgencySubscription>,
    ledger: HashMap<String, LedgerEntry>,
    committed: Vec<BillingWriteBatch>,
    fail_next_commit: Option<String>,
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserBilling) {
        self.state.lock().await.users.insert(user.user_id, user);
    }

    pub async fn insert_agency(&self, agency: AgencySubscription) {
        self.state
            .lock()
            .await
            .agencies
            .insert(agency.agency_id, agency);
    }

    pub async fn user(&self, user_id: UserId) -> Option<UserBilling> {
        self.state.lock().await.users.get(&user_id).cloned()
    }

    pub async fn agency(&self, agency_id: AgencyId) -> Option<AgencySubscription> {
        self.state.lock().await.agencies.get(&agency_id).cloned()
    }

    /// Batches committed so far, oldest first
    pub async fn committed_batches(&self) -> Vec<BillingWriteBatch> {
        self.state.lock().await.committed.clone()
    }

    /// Make the next commit fail without applying anything
    pub async fn fail_next_commit(&self, message: impl Into<String>) {
        self.state.lock().await.fail_next_commit = Some(message.into());
    }

    /// Ledger status of an event as `"processing"`, `"success"` or `"error"`
    pub async fn event_status(&self, event_id: &str) -> Option<&'static str> {
        self.state
            .lock()
            .await
            .ledger
            .get(event_id)
            .map(|entry| match entry.status {
                LedgerStatus::Processing => "processing",
                LedgerStatus::Success => "success",
                LedgerStatus::Error => "error",
            })
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn user_billing(&self, user_id: UserId) -> BillingResult<Option<UserBilling>> {
        Ok(self.user(user_id).await)
    }

    async fn agency_for_super_admin(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<AgencySubscription>> {
        Ok(self
            .state
            .lock()
            .await
            .agencies
            .values()
            .find(|a| a.super_admin_id == Some(user_id))
            .cloned())
    }

    async fn commit(&self, batch: BillingWriteBatch) -> BillingResult<()> {
        let mut state = self.state.lock().await;

        if let Some(message) = state.fail_next_commit.take() {
            return Err(BillingError::Database(message));
        }

        // Validate every target first so a failing batch changes nothing
        for write in batch.writes() {
            match write {
                BillingWrite::UpdateUser { user_id, .. } | BillingWrite::DeleteUser { user_id } => {
                    if !state.users.contains_key(user_id) {
                        return Err(BillingError::NotFound(format!("user {}", user_id)));
                    }
                }
                BillingWrite::UpdateAgency { agency_id, .. } => {
                    if !state.agencies.contains_key(agency_id) {
                        return Err(BillingError::NotFound(format!("agency {}", agency_id)));
                    }
                }
            }
        }

        for write in batch.writes() {
            match write {
                BillingWrite::UpdateUser { user_id, update } => {
                    if let Some(user) = state.users.get_mut(user_id) {
                        update.apply_to(user);
                    }
                }
                BillingWrite::UpdateAgency { agency_id, update } => {
                    if let Some(agency) = state.agencies.get_mut(agency_id) {
                        update.apply_to(agency);
                    }
                }
                BillingWrite::DeleteUser { user_id } => {
                    state.users.remove(user_id);
                    for agency in state.agencies.values_mut() {
                        if agency.super_admin_id == Some(*user_id) {
                            agency.super_admin_id = None;
                        }
                    }
                }
            }
        }

        if !batch.is_empty() {
            state.committed.push(batch);
        }
        Ok(())
    }

    async fn claim_event(&self, event_id: &str, _event_type: &str) -> BillingResult<EventClaim> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES));

        let claim = match state.ledger.get(event_id) {
            None => EventClaim::Claimed,
            Some(entry) => match entry.status {
                LedgerStatus::Success => EventClaim::AlreadyProcessed,
                LedgerStatus::Error => EventClaim::Claimed,
                LedgerStatus::Processing if entry.started_at < stuck_before => EventClaim::Claimed,
                LedgerStatus::Processing => EventClaim::InProgress,
            },
        };

        if claim == EventClaim::Claimed {
            state.ledger.insert(
                event_id.to_string(),
                LedgerEntry {
                    status: LedgerStatus::Processing,
                    started_at: now,
                },
            );
        }

        Ok(claim)
    }

    async fn finish_event(&self, event_id: &str, outcome: &EventOutcome) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .ledger
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("event {}", event_id)))?;
        entry.status = match outcome {
            EventOutcome::Success => LedgerStatus::Success,
            EventOutcome::Error(_) => LedgerStatus::Error,
        };
        Ok(())
    }

    async fn lapsed_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<UserId>> {
        let state = self.state.lock().await;
        let mut lapsed: Vec<&UserBilling> = state
            .users
            .values()
            .filter(|u| {
                u.subscription_status == SubscriptionStatus::Trial
                    && u.stripe_subscription_id.is_none()
                    && u.trial_end_date.is_some_and(|end| end < now)
            })
            .collect();
        lapsed.sort_by_key(|u| u.trial_end_date);
        Ok(lapsed.into_iter().map(|u| u.user_id).collect())
    }

    async fn agency_mirror_pairs(&self) -> BillingResult<Vec<(AgencySubscription, UserBilling)>> {
        let state = self.state.lock().await;
        Ok(state
            .agencies
            .values()
            .filter_map(|agency| {
                let user = state.users.get(&agency.super_admin_id?)?;
                Some((agency.clone(), user.clone()))
            })
            .collect())
    }
}
