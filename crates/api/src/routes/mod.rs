//! HTTP routes

pub mod admin;
pub mod bundles;
pub mod chat;
pub mod quota;
pub mod subscriptions;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/quota", get(quota::get_quota))
        .route("/v1/chat/send", post(chat::send_message))
        .route("/v1/chat/history", get(chat::get_history))
        .route("/v1/bundles", get(bundles::list_bundles))
        .route(
            "/v1/subscriptions",
            post(subscriptions::subscribe).get(subscriptions::list_subscriptions),
        )
        .route(
            "/v1/subscriptions/{id}/cancel",
            post(subscriptions::cancel),
        )
        .route(
            "/v1/subscriptions/{id}/auto-renewal",
            post(subscriptions::toggle_auto_renewal),
        )
        .route("/v1/admin/free-tier-reset", post(admin::free_tier_reset))
        .route("/v1/admin/invariants", get(admin::run_invariants))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
