//! Common types used across MyHealth Guide

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for UserId {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| SharedError::InvalidId(s.to_string()))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Care agency ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct AgencyId(pub Uuid);

impl AgencyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgencyId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AgencyId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for AgencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription status as stored on user and agency records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// Whether the subscription currently grants access
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trial | Self::Active)
    }
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Trial
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(SharedError::UnknownStatus(other.to_string())),
        }
    }
}

/// Internal plan tag identifying a subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanTag {
    Family,
    SingleAgency,
    MultiAgency,
}

impl PlanTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Family => "family",
            Self::SingleAgency => "single_agency",
            Self::MultiAgency => "multi_agency",
        }
    }
}

impl fmt::Display for PlanTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTag {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "family" => Ok(Self::Family),
            "single_agency" => Ok(Self::SingleAgency),
            "multi_agency" => Ok(Self::MultiAgency),
            other => Err(SharedError::UnknownPlanTag(other.to_string())),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Billing projection stored on a user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserBilling {
    pub user_id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_tier: Option<PlanTag>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub pending_plan_change: Option<PlanTag>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_date: Option<OffsetDateTime>,
}

impl UserBilling {
    /// A fresh trial user with no provider linkage
    pub fn new_trial(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
            name: None,
            subscription_status: SubscriptionStatus::Trial,
            subscription_tier: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            cancel_at_period_end: false,
            pending_plan_change: None,
            current_period_end: None,
            trial_end_date: None,
        }
    }
}

/// Agency record with its mirrored subscription block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AgencySubscription {
    pub agency_id: AgencyId,
    /// Cleared when the super-admin's account is deleted
    pub super_admin_id: Option<UserId>,
    pub name: String,
    pub tier: Option<PlanTag>,
    pub status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
}

impl AgencySubscription {
    /// An agency with an empty subscription block
    pub fn new(agency_id: AgencyId, super_admin_id: UserId, name: impl Into<String>) -> Self {
        Self {
            agency_id,
            super_admin_id: Some(super_admin_id),
            name: name.into(),
            tier: None,
            status: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            current_period_end: None,
            trial_ends_at: None,
        }
    }

    /// Whether the mirror agrees with the super-admin's billing fields
    pub fn mirrors(&self, user: &UserBilling) -> bool {
        self.tier == user.subscription_tier
            && self.status == Some(user.subscription_status)
            && self.stripe_customer_id == user.stripe_customer_id
            && self.stripe_subscription_id == user.stripe_subscription_id
            && self.current_period_end == user.current_period_end
            && self.trial_ends_at == user.trial_end_date
    }
}
