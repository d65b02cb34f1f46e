//! API routes

pub mod account;
pub mod billing;
pub mod health;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth required) - under /api/v1
    let mut public_api_routes = Router::new();

    // Stripe webhook (public, uses signature verification) - only when runtime config allows
    if state.config.enable_billing {
        public_api_routes = public_api_routes.route("/billing/webhook", post(billing::webhook));
    }

    // Protected routes (auth required) - under /api/v1
    let mut protected_routes =
        Router::new().route("/account", delete(account::delete_account));

    if state.config.enable_billing {
        protected_routes = protected_routes
            .route("/billing/subscription", get(billing::get_subscription))
            .route("/billing/subscription/cancel", post(billing::cancel_subscription))
            .route("/billing/subscription/resume", post(billing::resume_subscription));
    }

    let protected_routes = protected_routes
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_routes = public_api_routes.merge(protected_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .with_state(state)
}
