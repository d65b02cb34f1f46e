//! Account routes

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct AccountDeletedResponse {
    pub user_id: Uuid,
    pub subscription_canceled: bool,
    pub confirmation_email_sent: bool,
}

/// Delete the caller's account
///
/// Any live Stripe subscription is cancelled first; if Stripe refuses, the
/// account stays intact and the caller gets a 502.
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<AccountDeletedResponse>> {
    let billing = state.billing()?;

    let deletion = billing
        .account
        .delete_account(auth_user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Account deletion failed");
            ApiError::from(e)
        })?;

    tracing::info!(
        user_id = %deletion.user_id,
        agency_id = ?deletion.agency_id,
        subscription_canceled = deletion.canceled_subscription_id.is_some(),
        "Account deleted"
    );

    Ok(Json(AccountDeletedResponse {
        user_id: deletion.user_id.0,
        subscription_canceled: deletion.canceled_subscription_id.is_some(),
        confirmation_email_sent: deletion.email_sent,
    }))
}
