//! Quota endpoints

use axum::extract::State;
use axum::Json;

use chatmeter_billing::QuotaInfo;

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn get_quota(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<Json<QuotaInfo>> {
    let info = state.billing.ledger.quota_info(user_id).await?;
    Ok(Json(info))
}
