//! Webhook delivery through verification, ledger and projection

use myhealthguide_billing::{
    BillingError, BillingStore, EventOutcome, SkipReason, WebhookOutcome,
};
use myhealthguide_shared::{PlanTag, SubscriptionStatus};
use serde_json::json;

use crate::common::{
    event, schedule, sign, subscription, Harness, PRICE_FAMILY, PRICE_MULTI, PRICE_SINGLE,
};

#[tokio::test]
async fn invalid_signature_never_writes() {
    let h = Harness::new();
    let user_id = h.user().await;
    let payload = serde_json::to_vec(&event(
        "evt_forged",
        "customer.subscription.updated",
        subscription(Some(user_id), "active", PRICE_FAMILY),
    ))
    .unwrap();

    let mut header = sign(&payload);
    header.push('0');

    for header in [header.as_str(), "", "t=1,v1=00"] {
        assert!(matches!(
            h.billing.webhooks.verify_event(&payload, header),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    assert!(h.store.committed_batches().await.is_empty());
    assert_eq!(h.store.event_status("evt_forged").await, None);
    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_status,
        SubscriptionStatus::Trial
    );
}

#[tokio::test]
async fn active_subscription_is_projected() {
    let h = Harness::new();
    let user_id = h.user().await;

    let outcome = h
        .deliver(&event(
            "evt_1",
            "customer.subscription.created",
            subscription(Some(user_id), "active", PRICE_FAMILY),
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Applied(p) if p.agency_id.is_none()));
    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_status, SubscriptionStatus::Active);
    assert_eq!(user.subscription_tier, Some(PlanTag::Family));
    assert_eq!(user.stripe_customer_id.as_deref(), Some("cus_123"));
    assert_eq!(user.stripe_subscription_id.as_deref(), Some("sub_123"));
    assert_eq!(
        user.current_period_end.map(|t| t.unix_timestamp()),
        Some(1_750_000_000)
    );
    assert!(!user.cancel_at_period_end);
    assert_eq!(h.store.event_status("evt_1").await, Some("success"));
}

#[tokio::test]
async fn applying_same_update_twice_converges() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;
    let object = subscription(Some(user_id), "trialing", PRICE_MULTI);

    h.deliver(&event("evt_a", "customer.subscription.updated", object.clone()))
        .await
        .unwrap();
    let user_once = h.store.user(user_id).await.unwrap();
    let agency_once = h.store.agency(agency_id).await.unwrap();

    // Same payload under a new event id is processed again
    h.deliver(&event("evt_b", "customer.subscription.updated", object.clone()))
        .await
        .unwrap();
    assert_eq!(h.store.user(user_id).await.unwrap(), user_once);
    assert_eq!(h.store.agency(agency_id).await.unwrap(), agency_once);
    assert_eq!(h.store.committed_batches().await.len(), 2);

    // Same event id is deduplicated by the ledger
    let outcome = h
        .deliver(&event("evt_a", "customer.subscription.updated", object))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Duplicate);
    assert_eq!(h.store.committed_batches().await.len(), 2);
    assert_eq!(h.store.user(user_id).await.unwrap(), user_once);
}

#[tokio::test]
async fn super_admin_billing_is_mirrored_in_same_batch() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;

    let outcome = h
        .deliver(&event(
            "evt_1",
            "customer.subscription.updated",
            subscription(Some(user_id), "active", PRICE_SINGLE),
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Applied(p) if p.agency_id == Some(agency_id)));

    let batches = h.store.committed_batches().await;
    assert_eq!(batches.len(), 1);
    assert!(batches[0].touches_agency());

    let user = h.store.user(user_id).await.unwrap();
    let agency = h.store.agency(agency_id).await.unwrap();
    assert!(agency.mirrors(&user));
    assert_eq!(agency.tier, Some(PlanTag::SingleAgency));
    assert_eq!(agency.status, Some(SubscriptionStatus::Active));
}

#[tokio::test]
async fn non_super_admin_never_writes_agency() {
    let h = Harness::new();
    let (owner, agency_id) = h.super_admin().await;
    let member = h.user().await;
    let agency_before = h.store.agency(agency_id).await.unwrap();

    for (i, status) in ["active", "past_due", "canceled"].into_iter().enumerate() {
        h.deliver(&event(
            &format!("evt_{}", i),
            "customer.subscription.updated",
            subscription(Some(member), status, PRICE_MULTI),
        ))
        .await
        .unwrap();
    }
    h.deliver(&event(
        "evt_deleted",
        "customer.subscription.deleted",
        subscription(Some(member), "canceled", PRICE_MULTI),
    ))
    .await
    .unwrap();

    assert!(h
        .store
        .committed_batches()
        .await
        .iter()
        .all(|batch| !batch.touches_agency()));
    assert_eq!(h.store.agency(agency_id).await.unwrap(), agency_before);
    assert_eq!(
        h.store.agency(agency_id).await.unwrap().super_admin_id,
        Some(owner)
    );
}

#[tokio::test]
async fn past_due_expires_rather_than_cancels() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;

    h.deliver(&event(
        "evt_1",
        "customer.subscription.updated",
        subscription(Some(user_id), "past_due", PRICE_SINGLE),
    ))
    .await
    .unwrap();

    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_status,
        SubscriptionStatus::Expired
    );
    assert_eq!(
        h.store.agency(agency_id).await.unwrap().status,
        Some(SubscriptionStatus::Expired)
    );
}

#[tokio::test]
async fn schedule_with_future_plan_sets_pending_change() {
    let h = Harness::new();
    let user_id = h.user().await;
    h.gateway.schedule_price("sub_sched_1", Some(PRICE_SINGLE));

    let mut object = subscription(Some(user_id), "active", PRICE_MULTI);
    object["schedule"] = json!("sub_sched_1");
    h.deliver(&event("evt_1", "customer.subscription.updated", object))
        .await
        .unwrap();

    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_tier, Some(PlanTag::MultiAgency));
    assert_eq!(user.pending_plan_change, Some(PlanTag::SingleAgency));
}

#[tokio::test]
async fn schedule_for_current_plan_clears_pending_change() {
    let h = Harness::new();
    let user_id = h.user().await;
    h.gateway.schedule_price("sub_sched_1", Some(PRICE_SINGLE));

    let mut object = subscription(Some(user_id), "active", PRICE_MULTI);
    object["schedule"] = json!("sub_sched_1");
    h.deliver(&event("evt_1", "customer.subscription.updated", object))
        .await
        .unwrap();

    // The downgrade took effect and the schedule now points at the live price
    let mut object = subscription(Some(user_id), "active", PRICE_SINGLE);
    object["schedule"] = json!("sub_sched_1");
    h.deliver(&event("evt_2", "customer.subscription.updated", object))
        .await
        .unwrap();

    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_tier, Some(PlanTag::SingleAgency));
    assert_eq!(user.pending_plan_change, None);
}

#[tokio::test]
async fn schedule_lookup_failure_does_not_block_primary_write() {
    let h = Harness::new();
    let user_id = h.user().await;
    h.gateway.schedule_price("sub_sched_1", Some(PRICE_FAMILY));

    let mut object = subscription(Some(user_id), "active", PRICE_MULTI);
    object["schedule"] = json!("sub_sched_1");
    h.deliver(&event("evt_1", "customer.subscription.updated", object))
        .await
        .unwrap();
    assert_eq!(
        h.store.user(user_id).await.unwrap().pending_plan_change,
        Some(PlanTag::Family)
    );

    h.gateway.schedule_error("sub_sched_1");
    let mut object = subscription(Some(user_id), "past_due", PRICE_MULTI);
    object["schedule"] = json!("sub_sched_1");
    let outcome = h
        .deliver(&event("evt_2", "customer.subscription.updated", object))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Applied(_)));
    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_status, SubscriptionStatus::Expired);
    // Lookup failed, so the previous pending change is left as it was
    assert_eq!(user.pending_plan_change, Some(PlanTag::Family));
    assert_eq!(h.store.event_status("evt_2").await, Some("success"));
}

#[tokio::test]
async fn schedule_completed_clears_only_named_user() {
    let h = Harness::new();
    let target = h.user().await;
    let bystander = h.user().await;
    h.gateway.schedule_price("sub_sched_1", Some(PRICE_FAMILY));

    for (id, user) in [("evt_t", target), ("evt_b", bystander)] {
        let mut object = subscription(Some(user), "active", PRICE_MULTI);
        object["schedule"] = json!("sub_sched_1");
        h.deliver(&event(id, "customer.subscription.updated", object))
            .await
            .unwrap();
    }

    h.deliver(&event(
        "evt_done",
        "subscription_schedule.completed",
        schedule(Some(target)),
    ))
    .await
    .unwrap();

    assert_eq!(h.store.user(target).await.unwrap().pending_plan_change, None);
    assert_eq!(
        h.store.user(bystander).await.unwrap().pending_plan_change,
        Some(PlanTag::Family)
    );
}

#[tokio::test]
async fn schedule_canceled_and_released_clear_pending_change() {
    let h = Harness::new();
    let user_id = h.user().await;

    for (i, type_) in ["subscription_schedule.canceled", "subscription_schedule.released"]
        .into_iter()
        .enumerate()
    {
        h.gateway.schedule_price("sub_sched_1", Some(PRICE_FAMILY));
        let mut object = subscription(Some(user_id), "active", PRICE_MULTI);
        object["schedule"] = json!("sub_sched_1");
        h.deliver(&event(&format!("evt_sub_{}", i), "customer.subscription.updated", object))
            .await
            .unwrap();
        assert!(h.store.user(user_id).await.unwrap().pending_plan_change.is_some());

        h.deliver(&event(&format!("evt_sched_{}", i), type_, schedule(Some(user_id))))
            .await
            .unwrap();
        assert_eq!(h.store.user(user_id).await.unwrap().pending_plan_change, None);
    }
}

#[tokio::test]
async fn deleted_subscription_cancels_and_notifies() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;
    h.gateway.schedule_price("sub_sched_1", Some(PRICE_FAMILY));

    let mut object = subscription(Some(user_id), "active", PRICE_MULTI);
    object["schedule"] = json!("sub_sched_1");
    object["cancel_at_period_end"] = json!(true);
    h.deliver(&event("evt_1", "customer.subscription.updated", object))
        .await
        .unwrap();

    h.deliver(&event(
        "evt_2",
        "customer.subscription.deleted",
        subscription(Some(user_id), "canceled", PRICE_MULTI),
    ))
    .await
    .unwrap();

    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_status, SubscriptionStatus::Canceled);
    assert!(!user.cancel_at_period_end);
    assert_eq!(user.pending_plan_change, None);
    assert_eq!(
        h.store.agency(agency_id).await.unwrap().status,
        Some(SubscriptionStatus::Canceled)
    );
    assert_eq!(
        h.mailer.subjects(),
        vec!["Subscription Cancelled - MyHealth Guide".to_string()]
    );
}

#[tokio::test]
async fn cancellation_email_failure_does_not_fail_webhook() {
    let h = Harness::with_mailer(crate::common::RecordingMailer::failing());
    let user_id = h.user().await;

    let outcome = h
        .deliver(&event(
            "evt_1",
            "customer.subscription.deleted",
            subscription(Some(user_id), "canceled", PRICE_FAMILY),
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Applied(_)));
    assert_eq!(h.store.event_status("evt_1").await, Some("success"));
}

#[tokio::test]
async fn missing_user_id_is_skipped_without_write() {
    let h = Harness::new();
    h.user().await;

    let outcome = h
        .deliver(&event(
            "evt_1",
            "customer.subscription.updated",
            subscription(None, "active", PRICE_FAMILY),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Skipped(SkipReason::MissingUserId));

    let outcome = h
        .deliver(&event(
            "evt_2",
            "subscription_schedule.completed",
            schedule(None),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Skipped(SkipReason::MissingUserId));

    assert!(h.store.committed_batches().await.is_empty());
    assert_eq!(h.store.event_status("evt_1").await, Some("success"));
}

#[tokio::test]
async fn unknown_user_is_skipped() {
    let h = Harness::new();

    let outcome = h
        .deliver(&event(
            "evt_1",
            "customer.subscription.updated",
            subscription(Some(myhealthguide_shared::UserId::new()), "active", PRICE_FAMILY),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Skipped(SkipReason::UnknownUser));
    assert!(h.store.committed_batches().await.is_empty());
}

#[tokio::test]
async fn unhandled_event_types_are_acknowledged() {
    let h = Harness::new();

    let outcome = h
        .deliver(&event("evt_1", "invoice.paid", json!({"id": "in_1"})))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Acknowledged);
    assert!(h.store.committed_batches().await.is_empty());
}

#[tokio::test]
async fn failed_commit_writes_nothing_and_allows_redelivery() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;
    let delivery = event(
        "evt_1",
        "customer.subscription.updated",
        subscription(Some(user_id), "active", PRICE_SINGLE),
    );

    h.store.fail_next_commit("connection reset").await;
    let result = h.deliver(&delivery).await;

    assert!(matches!(result, Err(BillingError::Database(_))));
    assert_eq!(h.store.event_status("evt_1").await, Some("error"));
    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_status,
        SubscriptionStatus::Trial
    );
    assert_eq!(h.store.agency(agency_id).await.unwrap().status, None);

    // Stripe redelivers after the 500
    h.deliver(&delivery).await.unwrap();
    assert_eq!(h.store.event_status("evt_1").await, Some("success"));
    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_status,
        SubscriptionStatus::Active
    );
    assert_eq!(
        h.store.agency(agency_id).await.unwrap().status,
        Some(SubscriptionStatus::Active)
    );
}

#[tokio::test]
async fn unknown_price_falls_back_to_metadata_plan() {
    let h = Harness::new();
    let user_id = h.user().await;

    let mut object = subscription(Some(user_id), "active", "price_legacy_2023");
    object["metadata"]["planKey"] = json!("family");
    h.deliver(&event("evt_1", "customer.subscription.updated", object))
        .await
        .unwrap();
    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_tier,
        Some(PlanTag::Family)
    );

    // Unresolvable plan leaves the tier alone
    let object = subscription(Some(user_id), "active", "price_unknown");
    h.deliver(&event("evt_2", "customer.subscription.updated", object))
        .await
        .unwrap();
    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_tier,
        Some(PlanTag::Family)
    );
}

#[tokio::test]
async fn checkout_completion_links_stripe_ids() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;

    h.deliver(&event(
        "evt_1",
        "checkout.session.completed",
        json!({
            "id": "cs_1",
            "mode": "subscription",
            "customer": "cus_new",
            "subscription": "sub_new",
            "client_reference_id": user_id.to_string(),
            "metadata": {"plan": "multi_agency"}
        }),
    ))
    .await
    .unwrap();

    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.stripe_customer_id.as_deref(), Some("cus_new"));
    assert_eq!(user.stripe_subscription_id.as_deref(), Some("sub_new"));
    assert_eq!(user.subscription_tier, Some(PlanTag::MultiAgency));

    let agency = h.store.agency(agency_id).await.unwrap();
    assert_eq!(agency.stripe_subscription_id.as_deref(), Some("sub_new"));
}

#[tokio::test]
async fn trial_will_end_notifies_without_writing() {
    let h = Harness::new();
    let user_id = h.user().await;

    let outcome = h
        .deliver(&event(
            "evt_1",
            "customer.subscription.trial_will_end",
            subscription(Some(user_id), "trialing", PRICE_FAMILY),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Acknowledged);
    assert!(h.store.committed_batches().await.is_empty());
    assert_eq!(
        h.mailer.subjects(),
        vec!["Your Trial is Ending Soon - MyHealth Guide".to_string()]
    );
}

#[tokio::test]
async fn late_deletion_of_replaced_subscription_is_ignored() {
    let h = Harness::new();
    let (user_id, agency_id) = h.super_admin().await;

    h.deliver(&event(
        "evt_old_created",
        "customer.subscription.created",
        subscription(Some(user_id), "active", PRICE_FAMILY),
    ))
    .await
    .unwrap();

    let mut replacement = subscription(Some(user_id), "active", PRICE_MULTI);
    replacement["id"] = json!("sub_NEW");
    h.deliver(&event("evt_new_created", "customer.subscription.created", replacement))
        .await
        .unwrap();

    let outcome = h
        .deliver(&event(
            "evt_old_deleted",
            "customer.subscription.deleted",
            subscription(Some(user_id), "canceled", PRICE_FAMILY),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Skipped(SkipReason::StaleSubscription));
    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_status, SubscriptionStatus::Active);
    assert_eq!(user.stripe_subscription_id.as_deref(), Some("sub_NEW"));
    assert_eq!(user.subscription_tier, Some(PlanTag::MultiAgency));
    let agency = h.store.agency(agency_id).await.unwrap();
    assert_eq!(agency.stripe_subscription_id.as_deref(), Some("sub_NEW"));
    assert_eq!(agency.status, Some(SubscriptionStatus::Active));
    assert!(h.mailer.subjects().is_empty());
}

#[tokio::test]
async fn late_past_due_for_replaced_subscription_is_ignored() {
    let h = Harness::new();
    let user_id = h.user().await;

    let mut current = subscription(Some(user_id), "active", PRICE_SINGLE);
    current["id"] = json!("sub_NEW");
    h.deliver(&event("evt_new", "customer.subscription.created", current))
        .await
        .unwrap();

    let outcome = h
        .deliver(&event(
            "evt_old_past_due",
            "customer.subscription.updated",
            subscription(Some(user_id), "past_due", PRICE_FAMILY),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Skipped(SkipReason::StaleSubscription));
    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_status, SubscriptionStatus::Active);
    assert_eq!(user.subscription_tier, Some(PlanTag::SingleAgency));
}

#[tokio::test]
async fn new_live_subscription_replaces_the_old_one() {
    let h = Harness::new();
    let user_id = h.user().await;

    h.deliver(&event(
        "evt_old",
        "customer.subscription.created",
        subscription(Some(user_id), "active", PRICE_FAMILY),
    ))
    .await
    .unwrap();

    let mut replacement = subscription(Some(user_id), "trialing", PRICE_MULTI);
    replacement["id"] = json!("sub_NEW");
    let outcome = h
        .deliver(&event("evt_new", "customer.subscription.created", replacement))
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Applied(_)));
    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.stripe_subscription_id.as_deref(), Some("sub_NEW"));
    assert_eq!(user.subscription_status, SubscriptionStatus::Trial);
}

#[tokio::test]
async fn redelivery_during_in_flight_attempt_is_not_acknowledged() {
    let h = Harness::new();
    let user_id = h.user().await;
    let update = event(
        "evt_racing",
        "customer.subscription.updated",
        subscription(Some(user_id), "active", PRICE_MULTI),
    );

    // First delivery has claimed the event and is still running
    h.store
        .claim_event("evt_racing", "customer.subscription.updated")
        .await
        .unwrap();

    let outcome = h.deliver(&update).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::InFlight);
    assert_eq!(h.store.event_status("evt_racing").await, Some("processing"));

    // That attempt then fails; the retried delivery must still apply
    h.store
        .finish_event("evt_racing", &EventOutcome::Error("timeout".to_string()))
        .await
        .unwrap();

    let outcome = h.deliver(&update).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Applied(_)));
    let user = h.store.user(user_id).await.unwrap();
    assert_eq!(user.subscription_status, SubscriptionStatus::Active);
    assert_eq!(user.subscription_tier, Some(PlanTag::MultiAgency));
    assert_eq!(h.store.event_status("evt_racing").await, Some("success"));
}
