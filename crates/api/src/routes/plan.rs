//! Plan routes for the signed-in account owner

use axum::{extract::State, Extension, Json};
use bulldogo_billing::PlanView;
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Current plan of the signed-in account
pub async fn get_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PlanView>> {
    let view = state
        .billing
        .plans
        .view(&auth_user.account_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(view))
}

/// Schedule cancellation at the end of the paid period
pub async fn cancel_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PlanView>> {
    let view = state
        .billing
        .plans
        .schedule_cancel(&auth_user.account_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(view))
}

/// Withdraw a scheduled cancellation
pub async fn undo_cancel_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PlanView>> {
    let view = state
        .billing
        .plans
        .undo_cancel(&auth_user.account_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(view))
}
