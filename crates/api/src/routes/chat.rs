//! Metered chat endpoints

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use chatmeter_billing::{ChatHistoryPage, ChatMessage};

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MAX_QUERY_LENGTH: usize = 4_000;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: ChatMessage,
    pub remaining_messages: i32,
    pub is_unlimited: bool,
}

pub async fn send_message(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    let query = body.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    if query.len() > MAX_QUERY_LENGTH {
        return Err(ApiError::bad_request(format!(
            "query must be at most {MAX_QUERY_LENGTH} characters"
        )));
    }

    let reply = state.billing.chat.send_message(user_id, query).await?;
    Ok(Json(SendMessageResponse {
        message: reply.message,
        remaining_messages: reply.remaining_messages,
        is_unlimited: reply.is_unlimited,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

pub async fn get_history(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<Json<ChatHistoryPage>> {
    let page = state
        .billing
        .chat
        .history(user_id, params.page, params.limit)
        .await?;
    Ok(Json(page))
}
