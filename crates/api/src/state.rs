//! Application state

use std::sync::Arc;

use myhealthguide_billing::BillingService;
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Billing service; `None` when billing is disabled or not configured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Option<Arc<BillingService>>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);
        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    /// State for the auth middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub(crate) fn billing(&self) -> Result<&BillingService, crate::error::ApiError> {
        self.billing
            .as_deref()
            .ok_or(crate::error::ApiError::ServiceUnavailable)
    }
}
