//! Billing record store
//!
//! All billing state lives in user and agency records. Writers never update
//! one record at a time: they assemble a [`BillingWriteBatch`] and the store
//! commits it atomically, so a user's billing fields and their agency mirror
//! either both change or neither does.

use async_trait::async_trait;
use myhealthguide_shared::{
    AgencyId, AgencySubscription, PlanTag, SubscriptionStatus, UserBilling, UserId,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Events stuck in `processing` longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

// =============================================================================
// Field updates
// =============================================================================

/// Absolute values to set on a user record; `None` leaves a field untouched.
///
/// Nullable fields use `Option<Option<_>>` so that "clear" (`Some(None)`) is
/// distinct from "leave alone" (`None`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserBillingUpdate {
    pub subscription_status: Option<SubscriptionStatus>,
    pub subscription_tier: Option<PlanTag>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub cancel_at_period_end: Option<bool>,
    pub pending_plan_change: Option<Option<PlanTag>>,
    pub current_period_end: Option<Option<OffsetDateTime>>,
    pub trial_end_date: Option<Option<OffsetDateTime>>,
}

impl UserBillingUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, user: &mut UserBilling) {
        if let Some(status) = self.subscription_status {
            user.subscription_status = status;
        }
        if let Some(tier) = self.subscription_tier {
            user.subscription_tier = Some(tier);
        }
        if let Some(customer) = &self.stripe_customer_id {
            user.stripe_customer_id = Some(customer.clone());
        }
        if let Some(subscription) = &self.stripe_subscription_id {
            user.stripe_subscription_id = Some(subscription.clone());
        }
        if let Some(cancel) = self.cancel_at_period_end {
            user.cancel_at_period_end = cancel;
        }
        if let Some(pending) = self.pending_plan_change {
            user.pending_plan_change = pending;
        }
        if let Some(period_end) = self.current_period_end {
            user.current_period_end = period_end;
        }
        if let Some(trial_end) = self.trial_end_date {
            user.trial_end_date = trial_end;
        }
    }
}

/// Absolute values to set on an agency's subscription block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgencySubscriptionUpdate {
    pub tier: Option<PlanTag>,
    pub status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_end: Option<Option<OffsetDateTime>>,
    pub trial_ends_at: Option<Option<OffsetDateTime>>,
}

impl AgencySubscriptionUpdate {
    /// The agency-side projection of a user update
    pub fn mirror_of(update: &UserBillingUpdate) -> Self {
        Self {
            tier: update.subscription_tier,
            status: update.subscription_status,
            stripe_customer_id: update.stripe_customer_id.clone(),
            stripe_subscription_id: update.stripe_subscription_id.clone(),
            current_period_end: update.current_period_end,
            trial_ends_at: update.trial_end_date,
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, agency: &mut AgencySubscription) {
        if let Some(tier) = self.tier {
            agency.tier = Some(tier);
        }
        if let Some(status) = self.status {
            agency.status = Some(status);
        }
        if let Some(customer) = &self.stripe_customer_id {
            agency.stripe_customer_id = Some(customer.clone());
        }
        if let Some(subscription) = &self.stripe_subscription_id {
            agency.stripe_subscription_id = Some(subscription.clone());
        }
        if let Some(period_end) = self.current_period_end {
            agency.current_period_end = period_end;
        }
        if let Some(trial_end) = self.trial_ends_at {
            agency.trial_ends_at = trial_end;
        }
    }
}

// =============================================================================
// Batches
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingWrite {
    UpdateUser {
        user_id: UserId,
        update: UserBillingUpdate,
    },
    UpdateAgency {
        agency_id: AgencyId,
        update: AgencySubscriptionUpdate,
    },
    DeleteUser {
        user_id: UserId,
    },
}

/// An ordered group of writes committed all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillingWriteBatch {
    writes: Vec<BillingWrite>,
}

impl BillingWriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_user(mut self, user_id: UserId, update: UserBillingUpdate) -> Self {
        if !update.is_empty() {
            self.writes.push(BillingWrite::UpdateUser { user_id, update });
        }
        self
    }

    pub fn update_agency(mut self, agency_id: AgencyId, update: AgencySubscriptionUpdate) -> Self {
        if !update.is_empty() {
            self.writes
                .push(BillingWrite::UpdateAgency { agency_id, update });
        }
        self
    }

    pub fn delete_user(mut self, user_id: UserId) -> Self {
        self.writes.push(BillingWrite::DeleteUser { user_id });
        self
    }

    pub fn writes(&self) -> &[BillingWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn touches_agency(&self) -> bool {
        self.writes
            .iter()
            .any(|w| matches!(w, BillingWrite::UpdateAgency { .. }))
    }
}

// =============================================================================
// Event ledger
// =============================================================================

/// Result of trying to claim a webhook event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This worker owns processing of the event
    Claimed,
    /// A previous delivery was processed successfully
    AlreadyProcessed,
    /// Another delivery is being processed right now
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Success,
    Error(String),
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Success => "success",
            EventOutcome::Error(_) => "error",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            EventOutcome::Success => None,
            EventOutcome::Error(msg) => Some(msg),
        }
    }
}

// =============================================================================
// Store trait
// =============================================================================

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Billing projection of a user, if the user exists
    async fn user_billing(&self, user_id: UserId) -> BillingResult<Option<UserBilling>>;

    /// The agency whose super-admin is `user_id`, if any
    async fn agency_for_super_admin(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<AgencySubscription>>;

    /// Commit every write in the batch or none of them
    async fn commit(&self, batch: BillingWriteBatch) -> BillingResult<()>;

    /// Claim a delivered event id for processing
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim>;

    /// Record how processing of a claimed event ended
    async fn finish_event(&self, event_id: &str, outcome: &EventOutcome) -> BillingResult<()>;

    /// Users on an app-level trial (no provider subscription) whose trial ended before `now`
    async fn lapsed_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<UserId>>;

    /// Every agency with a super-admin, paired with that super-admin's billing
    async fn agency_mirror_pairs(&self) -> BillingResult<Vec<(AgencySubscription, UserBilling)>>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

const USER_COLUMNS: &str = r#"
    id AS user_id, email, name, subscription_status, subscription_tier,
    stripe_customer_id, stripe_subscription_id, cancel_at_period_end,
    pending_plan_change, current_period_end, trial_end_date
"#;

const AGENCY_COLUMNS: &str = r#"
    id AS agency_id, super_admin_id, name, subscription_tier AS tier,
    subscription_status AS status, stripe_customer_id, stripe_subscription_id,
    current_period_end, trial_ends_at
"#;

/// PostgreSQL-backed store; a batch is one transaction
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_user_update(user_id: UserId, update: &UserBillingUpdate) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE users SET updated_at = NOW()");

    if let Some(status) = update.subscription_status {
        qb.push(", subscription_status = ").push_bind(status);
    }
    if let Some(tier) = update.subscription_tier {
        qb.push(", subscription_tier = ").push_bind(tier);
    }
    if let Some(customer) = update.stripe_customer_id.clone() {
        qb.push(", stripe_customer_id = ").push_bind(customer);
    }
    if let Some(subscription) = update.stripe_subscription_id.clone() {
        qb.push(", stripe_subscription_id = ").push_bind(subscription);
    }
    if let Some(cancel) = update.cancel_at_period_end {
        qb.push(", cancel_at_period_end = ").push_bind(cancel);
    }
    if let Some(pending) = update.pending_plan_change {
        qb.push(", pending_plan_change = ").push_bind(pending);
    }
    if let Some(period_end) = update.current_period_end {
        qb.push(", current_period_end = ").push_bind(period_end);
    }
    if let Some(trial_end) = update.trial_end_date {
        qb.push(", trial_end_date = ").push_bind(trial_end);
    }

    qb.push(" WHERE id = ").push_bind(user_id);
    qb
}

fn push_agency_update(
    agency_id: AgencyId,
    update: &AgencySubscriptionUpdate,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE agencies SET updated_at = NOW()");

    if let Some(tier) = update.tier {
        qb.push(", subscription_tier = ").push_bind(tier);
    }
    if let Some(status) = update.status {
        qb.push(", subscription_status = ").push_bind(status);
    }
    if let Some(customer) = update.stripe_customer_id.clone() {
        qb.push(", stripe_customer_id = ").push_bind(customer);
    }
    if let Some(subscription) = update.stripe_subscription_id.clone() {
        qb.push(", stripe_subscription_id = ").push_bind(subscription);
    }
    if let Some(period_end) = update.current_period_end {
        qb.push(", current_period_end = ").push_bind(period_end);
    }
    if let Some(trial_end) = update.trial_ends_at {
        qb.push(", trial_ends_at = ").push_bind(trial_end);
    }

    qb.push(" WHERE id = ").push_bind(agency_id);
    qb
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn user_billing(&self, user_id: UserId) -> BillingResult<Option<UserBilling>> {
        let user = sqlx::query_as::<_, UserBilling>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn agency_for_super_admin(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<AgencySubscription>> {
        let agency = sqlx::query_as::<_, AgencySubscription>(&format!(
            "SELECT {} FROM agencies WHERE super_admin_id = $1 LIMIT 1",
            AGENCY_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(agency)
    }

    async fn commit(&self, batch: BillingWriteBatch) -> BillingResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for write in batch.writes() {
            let mut qb = match write {
                BillingWrite::UpdateUser { user_id, update } => push_user_update(*user_id, update),
                BillingWrite::UpdateAgency { agency_id, update } => {
                    push_agency_update(*agency_id, update)
                }
                BillingWrite::DeleteUser { user_id } => {
                    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM users WHERE id = ");
                    qb.push_bind(*user_id);
                    qb
                }
            };

            let result = qb.build().execute(&mut *tx).await?;

            if result.rows_affected() == 0 {
                let target = match write {
                    BillingWrite::UpdateAgency { agency_id, .. } => format!("agency {}", agency_id),
                    BillingWrite::UpdateUser { user_id, .. }
                    | BillingWrite::DeleteUser { user_id } => format!("user {}", user_id),
                };
                // Dropping the transaction rolls back earlier writes in the batch
                return Err(BillingError::NotFound(target));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim> {
        // Only one concurrent delivery can win the INSERT...ON CONFLICT...RETURNING.
        // Failed events and events stuck in 'processing' may be claimed again.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - ($3 || ' minutes')::INTERVAL)
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status,)) if status == "success" => EventClaim::AlreadyProcessed,
            _ => EventClaim::InProgress,
        })
    }

    async fn finish_event(&self, event_id: &str, outcome: &EventOutcome) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(outcome.as_str())
        .bind(outcome.error_message())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lapsed_trials(&self, now: OffsetDateTime) -> BillingResult<Vec<UserId>> {
        let rows: Vec<(UserId,)> = sqlx::query_as(
            r#"
            SELECT id FROM users
            WHERE subscription_status = 'trial'
              AND stripe_subscription_id IS NULL
              AND trial_end_date IS NOT NULL
              AND trial_end_date < $1
            ORDER BY trial_end_date ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn agency_mirror_pairs(&self) -> BillingResult<Vec<(AgencySubscription, UserBilling)>> {
        let agencies = sqlx::query_as::<_, AgencySubscription>(&format!(
            "SELECT {} FROM agencies WHERE super_admin_id IS NOT NULL",
            AGENCY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let admin_ids: Vec<uuid::Uuid> = agencies
            .iter()
            .filter_map(|a| a.super_admin_id.map(|id| id.0))
            .collect();

        let users = sqlx::query_as::<_, UserBilling>(&format!(
            "SELECT {} FROM users WHERE id = ANY($1)",
            USER_COLUMNS
        ))
        .bind(&admin_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: std::collections::HashMap<UserId, UserBilling> =
            users.into_iter().map(|u| (u.user_id, u)).collect();

        Ok(agencies
            .into_iter()
            .filter_map(|agency| {
                let user = agency.super_admin_id.and_then(|id| by_id.remove(&id))?;
                Some((agency, user))
            })
            .collect())
    }
}
