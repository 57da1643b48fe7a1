//! Bundle catalog endpoints

use axum::extract::State;
use axum::Json;

use chatmeter_billing::BundleTier;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_bundles(State(state): State<AppState>) -> ApiResult<Json<Vec<BundleTier>>> {
    let tiers = state.billing.catalog.list_active().await?;
    Ok(Json(tiers))
}
