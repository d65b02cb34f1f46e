//! Billing routes for Stripe integration

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use myhealthguide_billing::{WebhookOutcome, SIGNATURE_HEADER};
use myhealthguide_shared::{PlanTag, SubscriptionStatus, UserBilling};
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub status: SubscriptionStatus,
    pub tier: Option<PlanTag>,
    pub cancel_at_period_end: bool,
    /// Plan that takes effect at the next renewal, if one is scheduled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_plan_change: Option<PlanTag>,
    pub current_period_end: Option<String>,
    pub trial_end_date: Option<String>,
    pub has_stripe_subscription: bool,
}

fn format_time(t: Option<OffsetDateTime>) -> Option<String> {
    t.and_then(|t| t.format(&Rfc3339).ok())
}

impl From<UserBilling> for SubscriptionInfo {
    fn from(user: UserBilling) -> Self {
        Self {
            status: user.subscription_status,
            tier: user.subscription_tier,
            cancel_at_period_end: user.cancel_at_period_end,
            pending_plan_change: user.pending_plan_change,
            current_period_end: format_time(user.current_period_end),
            trial_end_date: format_time(user.trial_end_date),
            has_stripe_subscription: user.stripe_subscription_id.is_some(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// Handle Stripe webhook events
///
/// Signature failures answer 400 so Stripe stops retrying a forged or
/// misrouted delivery. Processing failures answer a generic 500 and a
/// delivery racing an in-flight attempt answers 409, so Stripe redelivers.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Stripe webhook verification failed");
        ApiError::from(e)
    })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let outcome = billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook handling error");
        ApiError::Internal
    })?;

    match outcome {
        WebhookOutcome::Applied(projection) => tracing::info!(
            user_id = %projection.user_id,
            agency_id = ?projection.agency_id,
            "Stripe webhook processed successfully"
        ),
        // A 2xx here would end Stripe's retries while the other attempt can still fail
        WebhookOutcome::InFlight => {
            return Err(ApiError::Conflict(
                "Event is already being processed".to_string(),
            ))
        }
        other => tracing::info!(outcome = ?other, "Stripe webhook acknowledged"),
    }

    Ok(Json(WebhookAck { received: true }))
}

/// Get the caller's subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing()?;
    let user = billing
        .subscriptions
        .get_subscription(auth_user.user_id)
        .await?;
    Ok(Json(user.into()))
}

/// Cancel the caller's subscription at the end of the current period
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing()?;

    let user = billing
        .subscriptions
        .cancel_at_period_end(auth_user.user_id)
        .await?;

    tracing::info!(user_id = %auth_user.user_id, "Subscription set to cancel at period end");
    Ok(Json(user.into()))
}

/// Undo a pending cancellation
pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing()?;

    let user = billing.subscriptions.resume(auth_user.user_id).await?;

    tracing::info!(user_id = %auth_user.user_id, "Subscription resumed");
    Ok(Json(user.into()))
}
