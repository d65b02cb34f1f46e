//! Shared fixtures

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use myhealthguide_billing::{
    BillingEmailService, BillingError, BillingResult, BillingService, EmailConfig,
    InMemoryBillingStore, Mailer, PriceIds, ProviderSubscription, StripeConfig, StripeGateway,
    WebhookVerifier, DEFAULT_WEBHOOK_TOLERANCE_SECS,
};
use myhealthguide_shared::{AgencyId, AgencySubscription, UserBilling, UserId};
use serde_json::{json, Value};
use time::OffsetDateTime;

pub const WEBHOOK_SECRET: &str = "whsec_integration_secret";
pub const PRICE_FAMILY: &str = "price_family";
pub const PRICE_SINGLE: &str = "price_single";
pub const PRICE_MULTI: &str = "price_multi";

pub fn stripe_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_integration".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        price_ids: PriceIds {
            family: PRICE_FAMILY.to_string(),
            single_agency: PRICE_SINGLE.to_string(),
            multi_agency: PRICE_MULTI.to_string(),
            family_annual: None,
            single_agency_annual: None,
            multi_agency_annual: Some("price_multi_year".to_string()),
        },
    }
}

fn email_config() -> EmailConfig {
    EmailConfig {
        resend_api_key: "re_test".to_string(),
        email_from: "MyHealth Guide <noreply@example.com>".to_string(),
        app_name: "MyHealth Guide".to_string(),
        support_email: "support@example.com".to_string(),
        dashboard_url: "https://app.example.com".to_string(),
    }
}

// ============================================================================
// Scripted Stripe gateway
// ============================================================================

#[derive(Default)]
pub struct ScriptedGateway {
    /// schedule id -> upcoming phase price, or an error message
    schedules: Mutex<HashMap<String, Result<Option<String>, String>>>,
    fail_cancel: Mutex<bool>,
    pub canceled: Mutex<Vec<String>>,
    pub cancel_flags: Mutex<Vec<(String, bool)>>,
}

impl ScriptedGateway {
    pub fn schedule_price(&self, schedule_id: &str, price: Option<&str>) {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule_id.to_string(), Ok(price.map(str::to_string)));
    }

    pub fn schedule_error(&self, schedule_id: &str) {
        self.schedules.lock().unwrap().insert(
            schedule_id.to_string(),
            Err("stripe unavailable".to_string()),
        );
    }

    pub fn fail_cancellations(&self) {
        *self.fail_cancel.lock().unwrap() = true;
    }
}

#[async_trait]
impl StripeGateway for ScriptedGateway {
    async fn upcoming_phase_price(&self, schedule_id: &str) -> BillingResult<Option<String>> {
        match self.schedules.lock().unwrap().get(schedule_id) {
            Some(Ok(price)) => Ok(price.clone()),
            Some(Err(message)) => Err(BillingError::StripeApi(message.clone())),
            None => Err(BillingError::StripeApi(format!(
                "No such subscription_schedule: {}",
                schedule_id
            ))),
        }
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<ProviderSubscription> {
        if *self.fail_cancel.lock().unwrap() {
            return Err(BillingError::StripeApi("card_declined".to_string()));
        }
        self.cancel_flags
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), cancel));
        Ok(ProviderSubscription {
            id: subscription_id.to_string(),
            status: "active".to_string(),
            cancel_at_period_end: cancel,
            current_period_end: OffsetDateTime::from_unix_timestamp(1_800_000_000).ok(),
        })
    }

    async fn cancel_now(&self, subscription_id: &str) -> BillingResult<()> {
        if *self.fail_cancel.lock().unwrap() {
            return Err(BillingError::StripeApi("api_connection_error".to_string()));
        }
        self.canceled
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Mailer
// ============================================================================

#[derive(Default)]
pub struct RecordingMailer {
    pub fail: Mutex<bool>,
    pub subjects: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subjects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _to: &str, subject: &str, _html: &str) -> BillingResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(BillingError::Internal("resend 503".to_string()));
        }
        self.subjects.lock().unwrap().push(subject.to_string());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<InMemoryBillingStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub mailer: Arc<RecordingMailer>,
    pub billing: BillingService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_mailer(RecordingMailer::default())
    }

    pub fn with_mailer(mailer: RecordingMailer) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let mailer = Arc::new(mailer);
        let email = BillingEmailService::with_mailer(email_config(), mailer.clone());
        let billing =
            BillingService::with_parts(stripe_config(), store.clone(), gateway.clone(), email);
        Self {
            store,
            gateway,
            mailer,
            billing,
        }
    }

    pub async fn user(&self) -> UserId {
        let user_id = UserId::new();
        let mut user = UserBilling::new_trial(user_id, format!("{}@example.com", user_id));
        user.name = Some("Pat".to_string());
        self.store.insert_user(user).await;
        user_id
    }

    /// A user who is super-admin of a fresh agency
    pub async fn super_admin(&self) -> (UserId, AgencyId) {
        let user_id = self.user().await;
        let agency_id = AgencyId::new();
        self.store
            .insert_agency(AgencySubscription::new(agency_id, user_id, "Sunrise Home Care"))
            .await;
        (user_id, agency_id)
    }

    /// Sign `event` and run it through verification and handling
    pub async fn deliver(
        &self,
        event: &Value,
    ) -> BillingResult<myhealthguide_billing::WebhookOutcome> {
        let payload = serde_json::to_vec(event).unwrap();
        let header = sign(&payload);
        let event = self.billing.webhooks.verify_event(&payload, &header)?;
        self.billing.webhooks.handle_event(event).await
    }
}

pub fn sign(payload: &[u8]) -> String {
    WebhookVerifier::new(WEBHOOK_SECRET, DEFAULT_WEBHOOK_TOLERANCE_SECS)
        .sign(payload, OffsetDateTime::now_utc().unix_timestamp())
        .unwrap()
}

// ============================================================================
// Event builders
// ============================================================================

pub fn event(id: &str, type_: &str, object: Value) -> Value {
    json!({
        "id": id,
        "type": type_,
        "created": 1_700_000_000,
        "livemode": false,
        "data": {"object": object}
    })
}

pub fn subscription(user_id: Option<UserId>, status: &str, price: &str) -> Value {
    let metadata = match user_id {
        Some(id) => json!({"userId": id.to_string()}),
        None => json!({}),
    };
    json!({
        "id": "sub_123",
        "object": "subscription",
        "customer": "cus_123",
        "status": status,
        "metadata": metadata,
        "cancel_at_period_end": false,
        "current_period_end": 1_750_000_000,
        "trial_end": null,
        "schedule": null,
        "items": {"object": "list", "data": [{"price": {"id": price}}]}
    })
}

pub fn schedule(user_id: Option<UserId>) -> Value {
    let metadata = match user_id {
        Some(id) => json!({"userId": id.to_string()}),
        None => json!({}),
    };
    json!({
        "id": "sub_sched_1",
        "object": "subscription_schedule",
        "status": "completed",
        "subscription": "sub_123",
        "metadata": metadata
    })
}
