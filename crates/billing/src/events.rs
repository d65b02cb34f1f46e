//! Stripe webhook event envelope
//!
//! Events are decoded with serde into the handful of fields the reconciler
//! reads rather than into the full `stripe::Event` type, so new Stripe API
//! versions that add or move fields do not break delivery.

use std::collections::HashMap;
use std::fmt;

use myhealthguide_shared::{PlanTag, UserId};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Metadata keys carrying the internal user id, in lookup order
pub const USER_ID_METADATA_KEYS: [&str; 2] = ["userId", "user_id"];

/// Metadata keys carrying a plan tag, in lookup order
pub const PLAN_METADATA_KEYS: [&str; 2] = ["planKey", "plan"];

/// Inbound event envelope: `{id, type, created, data: {object}}`
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// Parse a verified payload
    pub fn from_payload(payload: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.type_)
    }

    /// Decode `data.object` into a typed object
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!(
                "{} object did not decode: {}",
                self.type_, e
            ))
        })
    }
}

/// Event types the reconciler routes on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    SubscriptionTrialWillEnd,
    ScheduleCompleted,
    ScheduleCanceled,
    ScheduleReleased,
    CheckoutSessionCompleted,
    Other(String),
}

impl EventKind {
    pub fn from_type(type_: &str) -> Self {
        match type_ {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => Self::SubscriptionTrialWillEnd,
            "subscription_schedule.completed" => Self::ScheduleCompleted,
            "subscription_schedule.canceled" => Self::ScheduleCanceled,
            "subscription_schedule.released" => Self::ScheduleReleased,
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::SubscriptionTrialWillEnd => "customer.subscription.trial_will_end",
            Self::ScheduleCompleted => "subscription_schedule.completed",
            Self::ScheduleCanceled => "subscription_schedule.canceled",
            Self::ScheduleReleased => "subscription_schedule.released",
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::Other(other) => other,
        };
        f.write_str(s)
    }
}

/// A Stripe reference that may arrive as a bare id or an expanded object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

/// `data.object` of `customer.subscription.*` events
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub schedule: Option<Expandable>,
    #[serde(default)]
    pub items: ItemList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItemObject {
    #[serde(default)]
    pub price: Option<Expandable>,
    /// Newer API versions report the period on the item instead of the subscription
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(Expandable::id)
    }

    pub fn schedule_id(&self) -> Option<&str> {
        self.schedule.as_ref().map(Expandable::id)
    }

    /// Price of the first subscription item
    pub fn primary_price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(Expandable::id)
    }

    pub fn current_period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| {
                self.items
                    .data
                    .first()
                    .and_then(|item| item.current_period_end)
            })
            .and_then(unix_to_datetime)
    }

    pub fn trial_end(&self) -> Option<OffsetDateTime> {
        self.trial_end.and_then(unix_to_datetime)
    }
}

/// `data.object` of `subscription_schedule.*` events
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub status: Option<String>,
}

/// `data.object` of `checkout.session.completed`
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Internal user id from event metadata
///
/// Returns `None` when no key is present or the value is not a valid id;
/// such events are not tied to a tracked subscription.
pub fn metadata_user_id(metadata: &HashMap<String, String>) -> Option<UserId> {
    USER_ID_METADATA_KEYS
        .iter()
        .find_map(|key| metadata.get(*key))
        .and_then(|raw| match raw.parse::<UserId>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(value = %raw, "Ignoring malformed userId in Stripe metadata");
                None
            }
        })
}

/// Plan tag named in event metadata, if any
pub fn metadata_plan(metadata: &HashMap<String, String>) -> Option<PlanTag> {
    PLAN_METADATA_KEYS
        .iter()
        .filter_map(|key| metadata.get(*key))
        .find_map(|raw| raw.parse::<PlanTag>().ok())
}

pub fn unix_to_datetime(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}
