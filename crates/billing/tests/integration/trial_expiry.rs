//! Trial expiry sweep and mirror audit

use myhealthguide_shared::{SubscriptionStatus, UserBilling};
use time::{Duration, OffsetDateTime};

use crate::common::{event, subscription, Harness, PRICE_FAMILY};

#[tokio::test]
async fn expires_lapsed_app_trials_and_mirrors() {
    let h = Harness::new();
    let now = OffsetDateTime::now_utc();

    let (owner, agency_id) = h.super_admin().await;
    let mut user = h.store.user(owner).await.unwrap();
    user.trial_end_date = Some(now - Duration::days(1));
    h.store.insert_user(user).await;

    let fresh = h.user().await;
    let mut user = h.store.user(fresh).await.unwrap();
    user.trial_end_date = Some(now + Duration::days(5));
    h.store.insert_user(user).await;

    let sweep = h.billing.trials.expire_lapsed_trials(now).await.unwrap();

    assert_eq!(sweep.expired, vec![owner]);
    assert_eq!(sweep.failed, 0);
    assert_eq!(
        h.store.user(owner).await.unwrap().subscription_status,
        SubscriptionStatus::Expired
    );
    assert_eq!(
        h.store.agency(agency_id).await.unwrap().status,
        Some(SubscriptionStatus::Expired)
    );
    assert_eq!(
        h.store.user(fresh).await.unwrap().subscription_status,
        SubscriptionStatus::Trial
    );
}

#[tokio::test]
async fn stripe_trials_are_left_to_webhooks() {
    let h = Harness::new();
    let now = OffsetDateTime::now_utc();
    let user_id = h.user().await;

    let mut object = subscription(Some(user_id), "trialing", PRICE_FAMILY);
    object["trial_end"] = serde_json::json!((now - Duration::hours(2)).unix_timestamp());
    h.deliver(&event("evt_1", "customer.subscription.updated", object))
        .await
        .unwrap();

    let sweep = h.billing.trials.expire_lapsed_trials(now).await.unwrap();

    assert!(sweep.expired.is_empty());
    assert_eq!(
        h.store.user(user_id).await.unwrap().subscription_status,
        SubscriptionStatus::Trial
    );
}

#[tokio::test]
async fn audit_reports_diverged_agencies() {
    let h = Harness::new();
    let (owner, agency_id) = h.super_admin().await;
    let (in_sync, _) = h.super_admin().await;

    h.deliver(&event(
        "evt_1",
        "customer.subscription.updated",
        subscription(Some(in_sync), "active", PRICE_FAMILY),
    ))
    .await
    .unwrap();

    // Written behind the projector's back
    let mut user: UserBilling = h.store.user(owner).await.unwrap();
    user.subscription_status = SubscriptionStatus::Active;
    h.store.insert_user(user).await;

    let violations = h.billing.audit.audit().await.unwrap();

    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].agency_id, agency_id);
    assert_eq!(violations[0].super_admin_id, owner);
    assert_eq!(violations[0].fields, vec!["status"]);
}
