//! Chat metering gate
//!
//! The synchronous check-and-deduct path in front of the chat-completion
//! provider. Quota is deducted *before* the provider call: a client that
//! retries or abandons a slow request has still spent the message, which is
//! deliberate (the alternative lets a user bypass metering by cancelling
//! in-flight requests).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::quota::QuotaLedger;
use crate::store::ChatMessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Provider call result. Failure is expected steady-state behavior (the
/// stub fails 5% of the time), so it is data rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Completed(ChatCompletion),
    Failed { error: String },
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, query: &str) -> ChatOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// One metered chat exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub query: String,
    pub response: Option<String>,
    pub tokens: Option<TokenUsage>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatHistoryPage {
    pub messages: Vec<ChatMessage>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

/// Result of a metered send: the stored message plus the post-deduction
/// quota snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub message: ChatMessage,
    pub remaining_messages: i32,
    pub is_unlimited: bool,
}

const MAX_HISTORY_PAGE_SIZE: i64 = 100;

#[derive(Clone)]
pub struct ChatService {
    ledger: QuotaLedger,
    messages: Arc<dyn ChatMessageStore>,
    provider: Arc<dyn ChatProvider>,
}

impl ChatService {
    pub fn new(
        ledger: QuotaLedger,
        messages: Arc<dyn ChatMessageStore>,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        Self {
            ledger,
            messages,
            provider,
        }
    }

    /// The metering gate: quota check, pending record, deduct, provider
    /// call, then completion or failure. Quota stays consumed on provider
    /// failure.
    pub async fn send_message(&self, user_id: Uuid, query: &str) -> BillingResult<ChatReply> {
        let quota = self.ledger.quota_info(user_id).await?;
        if !quota.has_quota {
            return Err(BillingError::QuotaExceeded(
                "You have no remaining messages. Please upgrade your plan or wait for renewal."
                    .to_string(),
            ));
        }

        let pending = self.messages.create_pending(user_id, query).await?;
        self.ledger.deduct(user_id, 1).await?;

        let message = match self.provider.complete(query).await {
            ChatOutcome::Completed(completion) => {
                self.messages
                    .complete(pending.id, &completion.text, &completion.usage)
                    .await?
            }
            ChatOutcome::Failed { error } => {
                tracing::warn!(
                    user_id = %user_id,
                    message_id = %pending.id,
                    error = %error,
                    "Chat provider call failed"
                );
                self.messages.mark_failed(pending.id, &error).await?
            }
        };

        let updated = self.ledger.quota_info(user_id).await?;
        Ok(ChatReply {
            message,
            remaining_messages: updated.total_remaining_messages,
            is_unlimited: updated.is_unlimited,
        })
    }

    pub async fn history(
        &self,
        user_id: Uuid,
        page: i64,
        limit: i64,
    ) -> BillingResult<ChatHistoryPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_HISTORY_PAGE_SIZE);
        let offset = (page - 1) * limit;

        let messages = self.messages.find_by_user(user_id, limit, offset).await?;
        let total = self.messages.count_by_user(user_id).await?;
        Ok(ChatHistoryPage {
            messages,
            total,
            page,
            limit,
            total_pages: (total + limit - 1) / limit,
        })
    }
}

const CANNED_RESPONSES: [&str; 8] = [
    "That's a great question! Based on my analysis, the answer involves several key factors that we should consider carefully.",
    "I understand your query. Let me provide you with a comprehensive response that addresses all aspects of your question.",
    "Thank you for asking. Here's what I can tell you based on my knowledge and understanding of the topic.",
    "Interesting question! The topic you've raised has multiple dimensions that are worth exploring in detail.",
    "I'd be happy to help with that. Let me break down the answer into manageable parts for better understanding.",
    "Great inquiry! This is a fascinating area that requires thoughtful consideration of various perspectives.",
    "Your question touches on an important subject. Here's my take on it with relevant details and insights.",
    "I appreciate the complexity of your question. Let me provide a thorough response with practical examples.",
];

/// Stand-in for the real completion provider: canned responses, artificial
/// latency in place of a network round trip, and a baseline failure rate.
pub struct MockChatProvider {
    latency_ms: (u64, u64),
    failure_rate: f64,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            latency_ms: (3_000, 5_000),
            failure_rate: 0.05,
        }
    }

    /// Zero-latency, never-failing variant for tests.
    pub fn instant() -> Self {
        Self {
            latency_ms: (0, 0),
            failure_rate: 0.0,
        }
    }

    /// Zero-latency, always-failing variant for tests.
    pub fn always_failing() -> Self {
        Self {
            latency_ms: (0, 0),
            failure_rate: 1.0,
        }
    }
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn complete(&self, query: &str) -> ChatOutcome {
        // Draw everything up front; the RNG must not live across the await.
        let (delay_ms, failed, pick) = {
            let mut rng = rand::rng();
            let (min, max) = self.latency_ms;
            let delay_ms = if max > min {
                rng.random_range(min..=max)
            } else {
                min
            };
            let failed = rng.random::<f64>() < self.failure_rate;
            let pick = rng.random_range(0..CANNED_RESPONSES.len());
            (delay_ms, failed, pick)
        };

        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }

        if failed {
            return ChatOutcome::Failed {
                error: "Chat provider temporarily unavailable. Please try again later."
                    .to_string(),
            };
        }

        let mut preview: String = query.chars().take(50).collect();
        if query.chars().count() > 50 {
            preview.push_str("...");
        }
        let text = format!(
            "{}\n\nRegarding your specific question about \"{}\", I would suggest starting \
             from the core concepts, then examining the practical implications and potential \
             approaches. Is there anything specific you'd like me to elaborate on?",
            CANNED_RESPONSES[pick], preview
        );

        let prompt_tokens = (query.len() as i32 + 3) / 4;
        let completion_tokens = (text.len() as i32 + 3) / 4;
        ChatOutcome::Completed(ChatCompletion {
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            text,
        })
    }
}
