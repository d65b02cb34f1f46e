//! MyHealth Guide API Library
//!
//! HTTP surface for the billing reconciliation service: the Stripe webhook
//! endpoint, subscription self-service and account deletion.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
