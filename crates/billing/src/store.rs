//! Storage traits
//!
//! Persistent storage is an external collaborator: the engine talks to it
//! through these traits only. `postgres` provides the production
//! implementations, `memory` the in-process twins used by tests and local
//! runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chat::{ChatMessage, TokenUsage};
use crate::error::BillingResult;
use crate::quota::UserQuota;
use crate::subscriptions::Subscription;

/// Per-user quota rows.
#[async_trait]
pub trait UserQuotaStore: Send + Sync {
    async fn insert(&self, quota: &UserQuota) -> BillingResult<()>;

    async fn get(&self, user_id: Uuid) -> BillingResult<Option<UserQuota>>;

    /// Persist a full quota row. Plain last-write-wins; only `try_deduct`
    /// needs stronger guarantees.
    async fn update(&self, quota: &UserQuota) -> BillingResult<()>;

    /// Atomic check-and-decrement: the check and the write happen as one
    /// operation (a single conditional UPDATE in Postgres, a held lock in
    /// memory). Unlimited users succeed without counter changes. Returns the
    /// row after the deduction.
    async fn try_deduct(&self, user_id: Uuid, amount: i32) -> BillingResult<UserQuota>;

    /// Set one user's pool back to the free-tier floor.
    async fn reset_free_tier(&self, user_id: Uuid) -> BillingResult<UserQuota>;

    /// Set every free-tier user's pool back to the floor. Returns the number
    /// of rows touched.
    async fn reset_all_free_tier(&self) -> BillingResult<u64>;
}

/// One row per subscription purchase. Rows are never deleted; lifecycle
/// transitions flip `status`/`auto_renewal` and stamp `cancelled_at`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// All subscriptions for a user, newest first.
    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions (status set, not cancelled, end date in the
    /// future) for a user.
    async fn find_active_by_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>>;

    async fn find_active_by_user_and_tier(
        &self,
        user_id: Uuid,
        bundle_tier_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Subscription>>;

    async fn update(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Still-active subscriptions whose end date has passed. Safety net for
    /// expiry tasks lost by the queue.
    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;
}

/// Metered chat messages.
#[async_trait]
pub trait ChatMessageStore: Send + Sync {
    async fn create_pending(&self, user_id: Uuid, query: &str) -> BillingResult<ChatMessage>;

    async fn complete(
        &self,
        id: Uuid,
        response: &str,
        tokens: &TokenUsage,
    ) -> BillingResult<ChatMessage>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> BillingResult<ChatMessage>;

    /// A user's messages, newest first.
    async fn find_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<ChatMessage>>;

    async fn count_by_user(&self, user_id: Uuid) -> BillingResult<i64>;
}
