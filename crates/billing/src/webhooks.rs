//! Stripe webhook handling
//!
//! Verifies deliveries, claims them in the event ledger, routes them by type
//! and projects subscription state onto the user record and the agency
//! mirror. Every write is an absolute value, so redelivered or reordered
//! events converge on the same state.

use std::sync::Arc;

use myhealthguide_shared::{PlanTag, SubscriptionStatus, UserBilling, UserId};

use crate::client::StripeConfig;
use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::events::{
    metadata_plan, metadata_user_id, CheckoutSessionObject, EventKind, ScheduleObject,
    StripeEvent, SubscriptionObject,
};
use crate::gateway::StripeGateway;
use crate::plans::{map_provider_status, resolve_plan};
use crate::projector::{Projection, StateProjector};
use crate::signature::WebhookVerifier;
use crate::store::{BillingStore, EventClaim, EventOutcome, UserBillingUpdate};

/// Why an event was acknowledged without a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No `userId` in metadata; the object is not tied to a tracked user
    MissingUserId,
    /// `userId` names a user that no longer exists
    UnknownUser,
    /// A non-live subscription other than the one the user now holds
    StaleSubscription,
}

/// How a delivered event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied(Projection),
    Skipped(SkipReason),
    /// Handled without any state change
    Acknowledged,
    /// Already processed successfully
    Duplicate,
    /// Another delivery of the same event is still being processed; the
    /// provider must retry since that attempt may yet fail
    InFlight,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    config: StripeConfig,
    verifier: WebhookVerifier,
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn StripeGateway>,
    projector: StateProjector,
    email: BillingEmailService,
}

impl WebhookHandler {
    pub fn new(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn StripeGateway>,
        email: BillingEmailService,
    ) -> Self {
        let verifier = WebhookVerifier::new(
            config.webhook_secret.clone(),
            config.webhook_tolerance_secs,
        );
        let projector = StateProjector::new(store.clone());
        Self {
            config,
            verifier,
            store,
            gateway,
            projector,
            email,
        }
    }

    /// Verify the signature over the raw body, then parse the envelope
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<StripeEvent> {
        self.verifier.verify(payload, signature)?;
        StripeEvent::from_payload(payload)
    }

    /// Process a verified event exactly once
    ///
    /// Errors leave the ledger entry in `error` so the provider's redelivery
    /// is processed again.
    pub async fn handle_event(&self, event: StripeEvent) -> BillingResult<WebhookOutcome> {
        let claim = self.store.claim_event(&event.id, &event.type_).await.map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            e
        })?;

        match claim {
            EventClaim::Claimed => {}
            EventClaim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    "Duplicate webhook event - skipping"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            EventClaim::InProgress => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    "Webhook event is already being processed - asking for redelivery"
                );
                return Ok(WebhookOutcome::InFlight);
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(&event).await;

        let outcome = match &result {
            Ok(_) => EventOutcome::Success,
            Err(e) => EventOutcome::Error(e.to_string()),
        };

        if let Err(e) = self.store.finish_event(&event.id, &outcome).await {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "First attempt to record webhook outcome failed, retrying"
            );
            if let Err(retry_err) = self.store.finish_event(&event.id, &outcome).await {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    outcome = outcome.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook outcome after retry; event stays in processing until it times out"
                );
            }
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.type_,
                error = %e,
                "Webhook event processing failed"
            );
        }

        result
    }

    async fn process_event(&self, event: &StripeEvent) -> BillingResult<WebhookOutcome> {
        match event.kind() {
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription_change(event, false).await
            }
            EventKind::SubscriptionDeleted => self.handle_subscription_change(event, true).await,
            EventKind::SubscriptionTrialWillEnd => self.handle_trial_will_end(event).await,
            EventKind::ScheduleCompleted
            | EventKind::ScheduleCanceled
            | EventKind::ScheduleReleased => self.handle_schedule_finished(event).await,
            EventKind::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventKind::Other(type_) => {
                tracing::debug!(event_id = %event.id, event_type = %type_, "Unhandled webhook event type");
                Ok(WebhookOutcome::Acknowledged)
            }
        }
    }

    /// Look up the user named in metadata, or say why the event is skipped
    async fn tracked_user(
        &self,
        event: &StripeEvent,
        user_id: Option<UserId>,
    ) -> BillingResult<Result<UserBilling, SkipReason>> {
        let Some(user_id) = user_id else {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.type_,
                "No userId in metadata; event not tied to a tracked user"
            );
            return Ok(Err(SkipReason::MissingUserId));
        };

        match self.store.user_billing(user_id).await? {
            Some(user) => Ok(Ok(user)),
            None => {
                tracing::warn!(
                    event_id = %event.id,
                    user_id = %user_id,
                    "userId in metadata does not match any user"
                );
                Ok(Err(SkipReason::UnknownUser))
            }
        }
    }

    async fn handle_subscription_change(
        &self,
        event: &StripeEvent,
        deleted: bool,
    ) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionObject = event.object()?;

        let user = match self
            .tracked_user(event, metadata_user_id(&subscription.metadata))
            .await?
        {
            Ok(user) => user,
            Err(reason) => return Ok(WebhookOutcome::Skipped(reason)),
        };

        let plan = resolve_plan(
            &self.config,
            subscription.primary_price_id(),
            &subscription.metadata,
        );

        let status = if deleted {
            SubscriptionStatus::Canceled
        } else {
            map_provider_status(&subscription.status)
        };

        // Stripe does not order deliveries; the end of a replaced subscription
        // must not overwrite the one that replaced it
        if let Some(current) = user.stripe_subscription_id.as_deref() {
            if current != subscription.id && !status.is_live() {
                tracing::info!(
                    event_id = %event.id,
                    user_id = %user.user_id,
                    subscription_id = %subscription.id,
                    current_subscription_id = %current,
                    status = %status,
                    "Event is for a replaced subscription - skipping"
                );
                return Ok(WebhookOutcome::Skipped(SkipReason::StaleSubscription));
            }
        }

        let pending_plan_change = if deleted {
            Some(None)
        } else {
            self.pending_plan_change(&subscription, plan.or(user.subscription_tier))
                .await
        };

        let update = UserBillingUpdate {
            subscription_status: Some(status),
            subscription_tier: plan,
            stripe_customer_id: subscription.customer_id().map(str::to_string),
            stripe_subscription_id: Some(subscription.id.clone()),
            cancel_at_period_end: Some(!deleted && subscription.cancel_at_period_end),
            pending_plan_change,
            current_period_end: subscription.current_period_end().map(Some),
            trial_end_date: subscription.trial_end().map(Some),
        };

        tracing::info!(
            event_id = %event.id,
            user_id = %user.user_id,
            subscription_id = %subscription.id,
            stripe_status = %subscription.status,
            status = %status,
            plan = ?plan,
            "Projecting subscription"
        );

        let projection = self.projector.project(user.user_id, update).await?;

        if deleted {
            let email_sent = self
                .email
                .send_subscription_cancelled(
                    &user.email,
                    user.name.as_deref(),
                    plan.or(user.subscription_tier),
                )
                .await
                .unwrap_or(false);

            tracing::info!(
                event_id = %event.id,
                user_id = %user.user_id,
                email_sent = email_sent,
                "Subscription cancellation notice handled"
            );
        }

        Ok(WebhookOutcome::Applied(projection))
    }

    /// `pendingPlanChange` for a live subscription
    ///
    /// `None` means "leave untouched": the schedule lookup failed and the
    /// primary write goes ahead without it.
    async fn pending_plan_change(
        &self,
        subscription: &SubscriptionObject,
        effective_plan: Option<PlanTag>,
    ) -> Option<Option<PlanTag>> {
        let Some(schedule_id) = subscription.schedule_id() else {
            return Some(None);
        };

        match self.gateway.upcoming_phase_price(schedule_id).await {
            Ok(Some(price_id)) => {
                let next = self.config.plan_for_price_id(&price_id);
                if next.is_some() && next != effective_plan {
                    Some(next)
                } else {
                    Some(None)
                }
            }
            Ok(None) => Some(None),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    schedule_id = %schedule_id,
                    error = %e,
                    "Schedule lookup failed; leaving pendingPlanChange untouched"
                );
                None
            }
        }
    }

    async fn handle_trial_will_end(&self, event: &StripeEvent) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionObject = event.object()?;

        let user = match self
            .tracked_user(event, metadata_user_id(&subscription.metadata))
            .await?
        {
            Ok(user) => user,
            Err(reason) => return Ok(WebhookOutcome::Skipped(reason)),
        };

        let plan = resolve_plan(
            &self.config,
            subscription.primary_price_id(),
            &subscription.metadata,
        );

        let email_sent = self
            .email
            .send_trial_ending(
                &user.email,
                user.name.as_deref(),
                plan,
                subscription.trial_end(),
            )
            .await
            .unwrap_or(false);

        tracing::info!(
            event_id = %event.id,
            user_id = %user.user_id,
            email_sent = email_sent,
            "Trial ending notice handled"
        );

        Ok(WebhookOutcome::Acknowledged)
    }

    async fn handle_schedule_finished(&self, event: &StripeEvent) -> BillingResult<WebhookOutcome> {
        let schedule: ScheduleObject = event.object()?;

        let user = match self
            .tracked_user(event, metadata_user_id(&schedule.metadata))
            .await?
        {
            Ok(user) => user,
            Err(reason) => return Ok(WebhookOutcome::Skipped(reason)),
        };

        tracing::info!(
            event_id = %event.id,
            user_id = %user.user_id,
            schedule_id = %schedule.id,
            "Subscription schedule finished; clearing pending plan change"
        );

        let projection = self
            .projector
            .project(
                user.user_id,
                UserBillingUpdate {
                    pending_plan_change: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        Ok(WebhookOutcome::Applied(projection))
    }

    async fn handle_checkout_completed(&self, event: &StripeEvent) -> BillingResult<WebhookOutcome> {
        let session: CheckoutSessionObject = event.object()?;

        let user_id = metadata_user_id(&session.metadata).or_else(|| {
            session
                .client_reference_id
                .as_deref()
                .and_then(|raw| raw.parse::<UserId>().ok())
        });

        let user = match self.tracked_user(event, user_id).await? {
            Ok(user) => user,
            Err(reason) => return Ok(WebhookOutcome::Skipped(reason)),
        };

        let update = UserBillingUpdate {
            subscription_tier: metadata_plan(&session.metadata),
            stripe_customer_id: session
                .customer
                .as_ref()
                .map(|c| c.id().to_string()),
            stripe_subscription_id: session
                .subscription
                .as_ref()
                .map(|s| s.id().to_string()),
            ..Default::default()
        };

        if update.is_empty() {
            tracing::info!(
                event_id = %event.id,
                session_id = %session.id,
                "Checkout session carries no billing ids"
            );
            return Ok(WebhookOutcome::Acknowledged);
        }

        let projection = self.projector.project(user.user_id, update).await?;
        Ok(WebhookOutcome::Applied(projection))
    }
}
