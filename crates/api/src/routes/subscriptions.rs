//! Subscription endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chatmeter_billing::Subscription;
use chatmeter_shared::BillingCycle;

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub bundle_tier_id: Uuid,
    pub billing_cycle: BillingCycle,
}

pub async fn subscribe(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<SubscribeRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .subscribe(user_id, body.bundle_tier_id, body.billing_cycle)
        .await?;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub active: bool,
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(params): Query<ListQuery>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let subscriptions = state
        .billing
        .subscriptions
        .list(user_id, params.active)
        .await?;
    Ok(Json(subscriptions))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub message: String,
    pub subscription: Subscription,
}

pub async fn cancel(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let subscription = state.billing.subscriptions.cancel(user_id, id).await?;
    Ok(Json(CancelResponse {
        message: format!(
            "Subscription \"{}\" has been cancelled",
            subscription.bundle_name
        ),
        subscription,
    }))
}

pub async fn toggle_auto_renewal(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .toggle_auto_renewal(user_id, id)
        .await?;
    Ok(Json(subscription))
}
