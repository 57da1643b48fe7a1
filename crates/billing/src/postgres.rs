//! Postgres store implementations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::{BundleCatalog, BundleTier};
use crate::chat::{ChatMessage, MessageStatus, TokenUsage};
use crate::error::{BillingError, BillingResult};
use crate::quota::UserQuota;
use crate::store::{ChatMessageStore, SubscriptionStore, UserQuotaStore};
use crate::subscriptions::Subscription;

const USER_QUOTA_COLUMNS: &str = "id AS user_id, total_remaining_messages, is_free_tier, \
     attributed_bundle_id, attributed_remaining, attributed_bundle_name, \
     attributed_bundle_max_messages, updated_at";

#[derive(Clone)]
pub struct PgUserQuotaStore {
    pool: PgPool,
}

impl PgUserQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserQuotaStore for PgUserQuotaStore {
    async fn insert(&self, quota: &UserQuota) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, total_remaining_messages, is_free_tier, attributed_bundle_id,
                attributed_remaining, attributed_bundle_name,
                attributed_bundle_max_messages, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(quota.user_id)
        .bind(quota.total_remaining_messages)
        .bind(quota.is_free_tier)
        .bind(quota.attributed_bundle_id)
        .bind(quota.attributed_remaining)
        .bind(&quota.attributed_bundle_name)
        .bind(quota.attributed_bundle_max_messages)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserQuota>> {
        let quota = sqlx::query_as::<_, UserQuota>(&format!(
            "SELECT {USER_QUOTA_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quota)
    }

    async fn update(&self, quota: &UserQuota) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET total_remaining_messages = $2,
                is_free_tier = $3,
                attributed_bundle_id = $4,
                attributed_remaining = $5,
                attributed_bundle_name = $6,
                attributed_bundle_max_messages = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(quota.user_id)
        .bind(quota.total_remaining_messages)
        .bind(quota.is_free_tier)
        .bind(quota.attributed_bundle_id)
        .bind(quota.attributed_remaining)
        .bind(&quota.attributed_bundle_name)
        .bind(quota.attributed_bundle_max_messages)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::not_found(format!("user {}", quota.user_id)));
        }
        Ok(())
    }

    async fn try_deduct(&self, user_id: Uuid, amount: i32) -> BillingResult<UserQuota> {
        // Single conditional statement: the balance check and the decrement
        // cannot be interleaved by a concurrent request. Unlimited rows
        // (attributed max = -1) pass the guard and keep their counters.
        let updated = sqlx::query_as::<_, UserQuota>(&format!(
            r#"
            UPDATE users
            SET total_remaining_messages = CASE
                    WHEN attributed_bundle_max_messages = -1 THEN total_remaining_messages
                    ELSE total_remaining_messages - $2
                END,
                attributed_remaining = CASE
                    WHEN attributed_bundle_max_messages = -1 THEN attributed_remaining
                    WHEN attributed_bundle_id IS NOT NULL AND attributed_remaining > 0
                        THEN GREATEST(attributed_remaining - $2, 0)
                    ELSE attributed_remaining
                END,
                updated_at = NOW()
            WHERE id = $1
              AND (attributed_bundle_max_messages = -1 OR total_remaining_messages >= $2)
            RETURNING {USER_QUOTA_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(quota) => Ok(quota),
            // Guard failed: distinguish a missing user from an empty pool.
            None => match self.get(user_id).await? {
                Some(_) => Err(BillingError::QuotaExceeded(
                    "Insufficient message quota. Please upgrade your plan or wait for renewal."
                        .to_string(),
                )),
                None => Err(BillingError::not_found(format!("user {user_id}"))),
            },
        }
    }

    async fn reset_free_tier(&self, user_id: Uuid) -> BillingResult<UserQuota> {
        let quota = sqlx::query_as::<_, UserQuota>(&format!(
            r#"
            UPDATE users
            SET total_remaining_messages = $2,
                attributed_remaining = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_QUOTA_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(chatmeter_shared::FREE_TIER_MONTHLY_MESSAGES)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("user {user_id}")))?;
        Ok(quota)
    }

    async fn reset_all_free_tier(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET total_remaining_messages = $1,
                attributed_remaining = $1,
                updated_at = NOW()
            WHERE is_free_tier = TRUE
            "#,
        )
        .bind(chatmeter_shared::FREE_TIER_MONTHLY_MESSAGES)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Row shape for `subscriptions`; the billing cycle is stored as text.
#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    bundle_tier_id: Uuid,
    bundle_name: String,
    bundle_max_messages: i32,
    bundle_price_cents: i64,
    billing_cycle: String,
    auto_renewal: bool,
    status: bool,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    renewal_date: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let billing_cycle = row.billing_cycle.parse().map_err(BillingError::Internal)?;
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            bundle_tier_id: row.bundle_tier_id,
            bundle_name: row.bundle_name,
            bundle_max_messages: row.bundle_max_messages,
            bundle_price_cents: row.bundle_price_cents,
            billing_cycle,
            auto_renewal: row.auto_renewal,
            status: row.status,
            start_date: row.start_date,
            end_date: row.end_date,
            renewal_date: row.renewal_date,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, bundle_tier_id, bundle_name, \
     bundle_max_messages, bundle_price_cents, billing_cycle, auto_renewal, status, \
     start_date, end_date, renewal_date, cancelled_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn convert(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<Subscription>> {
        rows.into_iter().map(Subscription::try_from).collect()
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, bundle_tier_id, bundle_name, bundle_max_messages,
                bundle_price_cents, billing_cycle, auto_renewal, status,
                start_date, end_date, renewal_date, cancelled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.bundle_tier_id)
        .bind(&subscription.bundle_name)
        .bind(subscription.bundle_max_messages)
        .bind(subscription.bundle_price_cents)
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.auto_renewal)
        .bind(subscription.status)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.renewal_date)
        .bind(subscription.cancelled_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Self::convert(rows)
    }

    async fn find_active_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND status = TRUE AND cancelled_at IS NULL AND end_date > $2 \
             ORDER BY start_date DESC"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Self::convert(rows)
    }

    async fn find_active_by_user_and_tier(
        &self,
        user_id: Uuid,
        bundle_tier_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND bundle_tier_id = $2 AND status = TRUE \
               AND cancelled_at IS NULL AND end_date > $3 \
             LIMIT 1"
        ))
        .bind(user_id)
        .bind(bundle_tier_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn update(&self, subscription: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET auto_renewal = $2,
                status = $3,
                end_date = $4,
                renewal_date = $5,
                cancelled_at = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.auto_renewal)
        .bind(subscription.status)
        .bind(subscription.end_date)
        .bind(subscription.renewal_date)
        .bind(subscription.cancelled_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::not_found(format!(
                "subscription {}",
                subscription.id
            )));
        }
        Ok(())
    }

    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status = TRUE AND end_date <= $1 \
             ORDER BY end_date ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Self::convert(rows)
    }
}

#[derive(sqlx::FromRow)]
struct ChatMessageRow {
    id: Uuid,
    user_id: Uuid,
    query: String,
    response: Option<String>,
    tokens: Option<serde_json::Value>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChatMessageRow> for ChatMessage {
    type Error = BillingError;

    fn try_from(row: ChatMessageRow) -> Result<Self, Self::Error> {
        let status: MessageStatus = row.status.parse().map_err(BillingError::Internal)?;
        let tokens = row
            .tokens
            .map(serde_json::from_value::<TokenUsage>)
            .transpose()?;
        Ok(ChatMessage {
            id: row.id,
            user_id: row.user_id,
            query: row.query,
            response: row.response,
            tokens,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const CHAT_MESSAGE_COLUMNS: &str =
    "id, user_id, query, response, tokens, status, error_message, created_at, updated_at";

#[derive(Clone)]
pub struct PgChatMessageStore {
    pool: PgPool,
}

impl PgChatMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatMessageStore for PgChatMessageStore {
    async fn create_pending(&self, user_id: Uuid, query: &str) -> BillingResult<ChatMessage> {
        let row = sqlx::query_as::<_, ChatMessageRow>(&format!(
            r#"
            INSERT INTO chat_messages (id, user_id, query, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', NOW(), NOW())
            RETURNING {CHAT_MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(query)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn complete(
        &self,
        id: Uuid,
        response: &str,
        tokens: &TokenUsage,
    ) -> BillingResult<ChatMessage> {
        let row = sqlx::query_as::<_, ChatMessageRow>(&format!(
            r#"
            UPDATE chat_messages
            SET response = $2, tokens = $3, status = 'completed', updated_at = NOW()
            WHERE id = $1
            RETURNING {CHAT_MESSAGE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(response)
        .bind(serde_json::to_value(tokens)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("chat message {id}")))?;
        row.try_into()
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> BillingResult<ChatMessage> {
        let row = sqlx::query_as::<_, ChatMessageRow>(&format!(
            r#"
            UPDATE chat_messages
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {CHAT_MESSAGE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("chat message {id}")))?;
        row.try_into()
    }

    async fn find_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ChatMessage>> {
        let rows = sqlx::query_as::<_, ChatMessageRow>(&format!(
            "SELECT {CHAT_MESSAGE_COLUMNS} FROM chat_messages \
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ChatMessage::try_from).collect()
    }

    async fn count_by_user(&self, user_id: Uuid) -> BillingResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[derive(Clone)]
pub struct PgBundleCatalog {
    pool: PgPool,
}

impl PgBundleCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const BUNDLE_TIER_COLUMNS: &str = "id, name, max_messages, price_monthly_cents, \
     price_yearly_cents, is_active, deleted_at, created_at, updated_at";

#[async_trait]
impl BundleCatalog for PgBundleCatalog {
    async fn get(&self, id: Uuid) -> BillingResult<Option<BundleTier>> {
        let tier = sqlx::query_as::<_, BundleTier>(&format!(
            "SELECT {BUNDLE_TIER_COLUMNS} FROM bundle_tiers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tier)
    }

    async fn list_active(&self) -> BillingResult<Vec<BundleTier>> {
        let tiers = sqlx::query_as::<_, BundleTier>(&format!(
            "SELECT {BUNDLE_TIER_COLUMNS} FROM bundle_tiers \
             WHERE is_active = TRUE AND deleted_at IS NULL \
             ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(tiers)
    }
}
