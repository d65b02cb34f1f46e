//! Stripe client configuration

use myhealthguide_shared::PlanTag;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default tolerance for the `t=` timestamp in a Stripe-Signature header
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Maximum age of a signed webhook in seconds
    pub webhook_tolerance_secs: i64,
    /// Price IDs for each plan
    pub price_ids: PriceIds,
}

/// Stripe price IDs for each plan tag
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    // Monthly
    pub family: String,
    pub single_agency: String,
    pub multi_agency: String,

    // Annual (optional)
    pub family_annual: Option<String>,
    pub single_agency_annual: Option<String>,
    pub multi_agency_annual: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
            webhook_tolerance_secs: std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            price_ids: PriceIds {
                family: required_env("STRIPE_PRICE_FAMILY")?,
                single_agency: required_env("STRIPE_PRICE_SINGLE_AGENCY")?,
                multi_agency: required_env("STRIPE_PRICE_MULTI_AGENCY")?,

                family_annual: std::env::var("STRIPE_PRICE_FAMILY_ANNUAL").ok(),
                single_agency_annual: std::env::var("STRIPE_PRICE_SINGLE_AGENCY_ANNUAL").ok(),
                multi_agency_annual: std::env::var("STRIPE_PRICE_MULTI_AGENCY_ANNUAL").ok(),
            },
        })
    }

    /// Get plan tag from price ID (handles both monthly and annual prices)
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<PlanTag> {
        let ids = &self.price_ids;
        if price_id.is_empty() {
            None
        } else if price_id == ids.family || ids.family_annual.as_deref() == Some(price_id) {
            Some(PlanTag::Family)
        } else if price_id == ids.single_agency
            || ids.single_agency_annual.as_deref() == Some(price_id)
        {
            Some(PlanTag::SingleAgency)
        } else if price_id == ids.multi_agency
            || ids.multi_agency_annual.as_deref() == Some(price_id)
        {
            Some(PlanTag::MultiAgency)
        } else {
            None
        }
    }
}

fn required_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} not set", name)))
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
