#![allow(clippy::result_large_err)]
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MyHealth Guide Billing
//!
//! Stripe owns billing state. This crate projects it onto user records and,
//! for agency super-admins, onto the agency's mirrored subscription block.
//!
//! ## Features
//!
//! - **Webhooks**: Verify, deduplicate and project Stripe subscription events
//! - **Subscription Management**: Cancel at period end and resume
//! - **Account Deletion**: Cancel billing, then delete the user atomically
//! - **Trial Expiry**: Expire app-level trials Stripe never hears about
//! - **Mirror Audit**: Report agencies that disagree with their super-admin
//! - **Email Notifications**: Cancellation, trial ending, account deleted

pub mod account;
pub mod agency;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod memory;
pub mod plans;
pub mod projector;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod trials;
pub mod webhooks;

// Account
pub use account::{AccountDeletion, AccountDeletionService};

// Agency
pub use agency::AgencyResolver;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig, DEFAULT_WEBHOOK_TOLERANCE_SECS};

// Email
pub use email::{BillingEmailService, EmailConfig, Mailer, ResendMailer};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, StripeEvent};

// Gateway
pub use gateway::{ProviderSubscription, StripeApiGateway, StripeGateway};

// Invariants
pub use invariants::{MirrorAuditor, MirrorViolation};

// Stores
pub use memory::InMemoryBillingStore;
pub use store::{
    AgencySubscriptionUpdate, BillingStore, BillingWrite, BillingWriteBatch, EventClaim,
    EventOutcome, PgBillingStore, UserBillingUpdate,
};

// Projection
pub use plans::{map_provider_status, resolve_plan};
pub use projector::{Projection, StateProjector};

// Signature
pub use signature::{WebhookVerifier, SIGNATURE_HEADER};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Trials
pub use trials::{TrialExpiryService, TrialSweep};

// Webhooks
pub use webhooks::{SkipReason, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub account: AccountDeletionService,
    pub audit: MirrorAuditor,
    pub email: BillingEmailService,
    pub subscriptions: SubscriptionService,
    pub trials: TrialExpiryService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config, backed by PostgreSQL and Stripe
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config.clone());
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        let gateway: Arc<dyn StripeGateway> = Arc::new(StripeApiGateway::new(stripe));
        Self::with_parts(config, store, gateway, BillingEmailService::from_env())
    }

    /// Assemble from explicit collaborators
    pub fn with_parts(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn StripeGateway>,
        email: BillingEmailService,
    ) -> Self {
        Self {
            account: AccountDeletionService::new(store.clone(), gateway.clone(), email.clone()),
            audit: MirrorAuditor::new(store.clone()),
            email: email.clone(),
            subscriptions: SubscriptionService::new(store.clone(), gateway.clone()),
            trials: TrialExpiryService::new(store.clone()),
            webhooks: WebhookHandler::new(config, store, gateway, email),
        }
    }
}
