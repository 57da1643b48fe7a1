//! In-memory store implementations
//!
//! Process-local twins of the Postgres stores, used by the test suite and
//! by single-node development runs without a database. The quota store
//! holds its lock across the deduct check-and-write, matching the atomicity
//! of the conditional UPDATE in the Postgres implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use chatmeter_shared::FREE_TIER_MONTHLY_MESSAGES;

use crate::catalog::{BundleCatalog, BundleTier};
use crate::chat::{ChatMessage, MessageStatus, TokenUsage};
use crate::error::{BillingError, BillingResult};
use crate::quota::UserQuota;
use crate::store::{ChatMessageStore, SubscriptionStore, UserQuotaStore};
use crate::subscriptions::Subscription;

#[derive(Default)]
pub struct InMemoryUserQuotaStore {
    rows: RwLock<HashMap<Uuid, UserQuota>>,
}

impl InMemoryUserQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserQuotaStore for InMemoryUserQuotaStore {
    async fn insert(&self, quota: &UserQuota) -> BillingResult<()> {
        self.rows
            .write()
            .await
            .insert(quota.user_id, quota.clone());
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserQuota>> {
        Ok(self.rows.read().await.get(&user_id).cloned())
    }

    async fn update(&self, quota: &UserQuota) -> BillingResult<()> {
        let mut rows = self.rows.write().await;
        let mut row = quota.clone();
        row.updated_at = Utc::now();
        rows.insert(row.user_id, row);
        Ok(())
    }

    async fn try_deduct(&self, user_id: Uuid, amount: i32) -> BillingResult<UserQuota> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::not_found(format!("user {user_id}")))?;
        row.deduct(amount)?;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn reset_free_tier(&self, user_id: Uuid) -> BillingResult<UserQuota> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::not_found(format!("user {user_id}")))?;
        row.reset_free_floor();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn reset_all_free_tier(&self) -> BillingResult<u64> {
        let mut rows = self.rows.write().await;
        let mut count = 0;
        for row in rows.values_mut().filter(|r| r.is_free_tier) {
            row.reset_free_floor();
            row.updated_at = Utc::now();
            count += 1;
        }
        debug_assert!(rows
            .values()
            .filter(|r| r.is_free_tier)
            .all(|r| r.total_remaining_messages == FREE_TIER_MONTHLY_MESSAGES));
        Ok(count)
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    rows: RwLock<HashMap<Uuid, Subscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
        self.rows
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn find_active_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.is_active(now))
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(subs)
    }

    async fn find_active_by_user_and_tier(
        &self,
        user_id: Uuid,
        bundle_tier_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|s| {
                s.user_id == user_id && s.bundle_tier_id == bundle_tier_id && s.is_active(now)
            })
            .cloned())
    }

    async fn update(&self, subscription: &Subscription) -> BillingResult<()> {
        self.rows
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .rows
            .read()
            .await
            .values()
            .filter(|s| s.status && s.end_date <= now)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.end_date);
        subs.truncate(limit as usize);
        Ok(subs)
    }
}

#[derive(Default)]
pub struct InMemoryChatMessageStore {
    rows: RwLock<HashMap<Uuid, ChatMessage>>,
}

impl InMemoryChatMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_mut<R>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut ChatMessage) -> R,
    ) -> BillingResult<ChatMessage> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found(format!("chat message {id}")))?;
        apply(row);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[async_trait]
impl ChatMessageStore for InMemoryChatMessageStore {
    async fn create_pending(&self, user_id: Uuid, query: &str) -> BillingResult<ChatMessage> {
        let now = Utc::now();
        let message = ChatMessage {
            id: Uuid::new_v4(),
            user_id,
            query: query.to_string(),
            response: None,
            tokens: None,
            status: MessageStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.write().await.insert(message.id, message.clone());
        Ok(message)
    }

    async fn complete(
        &self,
        id: Uuid,
        response: &str,
        tokens: &TokenUsage,
    ) -> BillingResult<ChatMessage> {
        self.get_mut(id, |m| {
            m.response = Some(response.to_string());
            m.tokens = Some(*tokens);
            m.status = MessageStatus::Completed;
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> BillingResult<ChatMessage> {
        self.get_mut(id, |m| {
            m.status = MessageStatus::Failed;
            m.error_message = Some(error.to_string());
        })
        .await
    }

    async fn find_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self
            .rows
            .read()
            .await
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(messages
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_by_user(&self, user_id: Uuid) -> BillingResult<i64> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|m| m.user_id == user_id)
            .count() as i64)
    }
}

#[derive(Default)]
pub struct InMemoryBundleCatalog {
    rows: RwLock<HashMap<Uuid, BundleTier>>,
}

impl InMemoryBundleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a tier. Catalog mutations are admin tooling concerns
    /// outside the read-only trait, so this lives on the concrete type.
    pub async fn upsert(&self, tier: BundleTier) {
        self.rows.write().await.insert(tier.id, tier);
    }
}

#[async_trait]
impl BundleCatalog for InMemoryBundleCatalog {
    async fn get(&self, id: Uuid) -> BillingResult<Option<BundleTier>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list_active(&self) -> BillingResult<Vec<BundleTier>> {
        let mut tiers: Vec<BundleTier> = self
            .rows
            .read()
            .await
            .values()
            .filter(|t| t.is_available())
            .cloned()
            .collect();
        tiers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tiers)
    }
}
