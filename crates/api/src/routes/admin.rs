//! Operational endpoints
//!
//! Deployed behind the gateway's admin policy; this service does not do its
//! own role checks.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use chatmeter_billing::InvariantCheckSummary;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct FreeTierResetResponse {
    pub reset_count: u64,
}

/// Manual trigger for the monthly free-tier reset. Idempotent: the floor is
/// set absolutely, so re-running harms nothing.
pub async fn free_tier_reset(
    State(state): State<AppState>,
) -> ApiResult<Json<FreeTierResetResponse>> {
    let reset_count = state.billing.ledger.reset_all_free_tier_users().await?;
    Ok(Json(FreeTierResetResponse { reset_count }))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
