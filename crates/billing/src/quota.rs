//! Quota ledger
//!
//! Owns the per-user remaining-message pool and the attributed-bundle
//! pointer. The pool is a single rolling aggregate: every lifecycle event
//! adjusts it additively or subtractively, and one sub-counter tracks how
//! much of the pool belongs to the currently attributed bundle so that
//! expiry and renewal can net that portion out correctly.
//!
//! All transition math lives in pure methods on [`UserQuota`]; the
//! [`QuotaLedger`] service loads rows through [`UserQuotaStore`], applies a
//! transition, and persists the result. The one exception is `deduct`,
//! which the store executes atomically (single conditional UPDATE) so two
//! concurrent chat requests cannot both pass the balance check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use chatmeter_shared::{
    FREE_TIER_MONTHLY_MESSAGES, UNLIMITED_MAX_MESSAGES, UNLIMITED_QUOTA_SENTINEL,
};

use crate::error::{BillingError, BillingResult};
use crate::store::UserQuotaStore;
use crate::subscriptions::Subscription;

pub const FREE_TIER_BUNDLE_NAME: &str = "Free Tier";

/// Per-user quota row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UserQuota {
    pub user_id: Uuid,
    /// Aggregate remaining pool across the free tier and all paid bundles.
    pub total_remaining_messages: i32,
    pub is_free_tier: bool,
    /// Subscription currently treated as the primary quota source.
    pub attributed_bundle_id: Option<Uuid>,
    /// Portion of the pool belonging to the attributed bundle. Informational
    /// for expiry/renewal netting, not a cap on its own.
    pub attributed_remaining: i32,
    pub attributed_bundle_name: Option<String>,
    pub attributed_bundle_max_messages: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

/// Read model returned to callers of the ledger.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuotaInfo {
    pub total_remaining_messages: i32,
    pub is_free_tier: bool,
    pub attributed_bundle_id: Option<Uuid>,
    pub attributed_bundle_remaining: Option<i32>,
    pub attributed_bundle_name: Option<String>,
    pub attributed_bundle_max_messages: Option<i32>,
    pub has_quota: bool,
    pub is_unlimited: bool,
}

impl UserQuota {
    /// Fresh free-tier row, as created when an account is provisioned.
    pub fn new_free_tier(user_id: Uuid) -> Self {
        Self {
            user_id,
            total_remaining_messages: FREE_TIER_MONTHLY_MESSAGES,
            is_free_tier: true,
            attributed_bundle_id: None,
            attributed_remaining: FREE_TIER_MONTHLY_MESSAGES,
            attributed_bundle_name: Some(FREE_TIER_BUNDLE_NAME.to_string()),
            attributed_bundle_max_messages: Some(FREE_TIER_MONTHLY_MESSAGES),
            updated_at: Utc::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.attributed_bundle_max_messages == Some(UNLIMITED_MAX_MESSAGES)
    }

    pub fn info(&self) -> QuotaInfo {
        let is_unlimited = self.is_unlimited();
        QuotaInfo {
            total_remaining_messages: self.total_remaining_messages,
            is_free_tier: self.is_free_tier,
            attributed_bundle_id: self.attributed_bundle_id,
            attributed_bundle_remaining: self
                .attributed_bundle_id
                .map(|_| self.attributed_remaining),
            attributed_bundle_name: self.attributed_bundle_name.clone(),
            attributed_bundle_max_messages: self.attributed_bundle_max_messages,
            has_quota: is_unlimited || self.total_remaining_messages > 0,
            is_unlimited,
        }
    }

    /// Consume `amount` messages. No-op success for unlimited users;
    /// `QuotaExceeded` when the pool is short.
    pub fn deduct(&mut self, amount: i32) -> BillingResult<()> {
        if self.is_unlimited() {
            return Ok(());
        }
        if self.total_remaining_messages < amount {
            return Err(BillingError::QuotaExceeded(
                "Insufficient message quota. Please upgrade your plan or wait for renewal."
                    .to_string(),
            ));
        }
        self.total_remaining_messages -= amount;
        if self.attributed_bundle_id.is_some() && self.attributed_remaining > 0 {
            self.attributed_remaining = (self.attributed_remaining - amount).max(0);
        }
        Ok(())
    }

    /// Attach a newly purchased or renewed bundle. The aggregate pool is
    /// additive, but the attribution pointer always resets to the new
    /// bundle's full allowance regardless of what was already accumulated.
    pub fn grant(&mut self, subscription_id: Uuid, bundle_name: &str, bundle_max_messages: i32) {
        if bundle_max_messages == UNLIMITED_MAX_MESSAGES {
            self.total_remaining_messages = UNLIMITED_QUOTA_SENTINEL;
        } else {
            self.total_remaining_messages = self
                .total_remaining_messages
                .saturating_add(bundle_max_messages);
        }
        self.is_free_tier = false;
        self.attributed_bundle_id = Some(subscription_id);
        self.attributed_remaining = bundle_max_messages;
        self.attributed_bundle_name = Some(bundle_name.to_string());
        self.attributed_bundle_max_messages = Some(bundle_max_messages);
    }

    /// Grant on successful renewal: when the renewing subscription is the
    /// attributed bundle, its stale remainder is netted out of the pool
    /// first so the fresh allowance is not double counted.
    pub fn renew(&mut self, subscription_id: Uuid, bundle_name: &str, bundle_max_messages: i32) {
        if self.attributed_bundle_id == Some(subscription_id) {
            let stale = self.attributed_portion();
            self.total_remaining_messages = (self.total_remaining_messages - stale).max(0);
        }
        self.grant(subscription_id, bundle_name, bundle_max_messages);
    }

    /// Remove the expiring subscription's share of the pool. Returns the
    /// amount removed: the attributed remainder when it is the attributed
    /// bundle, otherwise 0 (no per-subscription balance is tracked for
    /// non-attributed bundles).
    pub fn expire(&mut self, subscription_id: Uuid) -> i32 {
        if self.attributed_bundle_id != Some(subscription_id) {
            return 0;
        }
        let removed = self.attributed_portion();
        self.total_remaining_messages = (self.total_remaining_messages - removed).max(0);
        removed
    }

    /// Re-point attribution at a surviving subscription after an expiry.
    /// The entire remaining pool is folded into the new attributed bundle's
    /// sub-counter.
    pub fn attribute_fallback(&mut self, subscription: &Subscription) {
        self.attributed_bundle_id = Some(subscription.id);
        self.attributed_remaining = self.total_remaining_messages;
        self.attributed_bundle_name = Some(subscription.bundle_name.clone());
        self.attributed_bundle_max_messages = Some(subscription.bundle_max_messages);
        self.is_free_tier = false;
    }

    /// Drop back to the free tier: floor pool, cleared attribution.
    pub fn shift_to_free_tier(&mut self) {
        self.is_free_tier = true;
        self.total_remaining_messages = FREE_TIER_MONTHLY_MESSAGES;
        self.attributed_bundle_id = None;
        self.attributed_remaining = FREE_TIER_MONTHLY_MESSAGES;
        self.attributed_bundle_name = Some(FREE_TIER_BUNDLE_NAME.to_string());
        self.attributed_bundle_max_messages = Some(FREE_TIER_MONTHLY_MESSAGES);
    }

    /// Monthly free-tier floor reset.
    pub fn reset_free_floor(&mut self) {
        self.total_remaining_messages = FREE_TIER_MONTHLY_MESSAGES;
        self.attributed_remaining = FREE_TIER_MONTHLY_MESSAGES;
    }

    /// The attributed bundle's share of the pool. For an unlimited bundle
    /// that share is the whole (sentinel) pool.
    fn attributed_portion(&self) -> i32 {
        if self.is_unlimited() {
            self.total_remaining_messages
        } else {
            self.attributed_remaining.max(0)
        }
    }
}

/// Quota operations over a [`UserQuotaStore`].
#[derive(Clone)]
pub struct QuotaLedger {
    users: Arc<dyn UserQuotaStore>,
}

impl QuotaLedger {
    pub fn new(users: Arc<dyn UserQuotaStore>) -> Self {
        Self { users }
    }

    async fn load(&self, user_id: Uuid) -> BillingResult<UserQuota> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("user {user_id}")))
    }

    pub async fn quota_info(&self, user_id: Uuid) -> BillingResult<QuotaInfo> {
        Ok(self.load(user_id).await?.info())
    }

    /// Consume messages. Atomic at the store layer.
    pub async fn deduct(&self, user_id: Uuid, amount: i32) -> BillingResult<QuotaInfo> {
        let quota = self.users.try_deduct(user_id, amount).await?;
        tracing::debug!(
            user_id = %user_id,
            amount = amount,
            remaining = quota.total_remaining_messages,
            "Quota deducted"
        );
        Ok(quota.info())
    }

    /// Attach a newly purchased bundle.
    pub async fn grant_bundle(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        bundle_name: &str,
        bundle_max_messages: i32,
    ) -> BillingResult<QuotaInfo> {
        let mut quota = self.load(user_id).await?;
        quota.grant(subscription_id, bundle_name, bundle_max_messages);
        self.users.update(&quota).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            bundle = bundle_name,
            total = quota.total_remaining_messages,
            "Bundle quota granted"
        );
        Ok(quota.info())
    }

    /// Re-grant on successful renewal, netting out the stale attributed
    /// remainder.
    pub async fn renew_bundle(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        bundle_name: &str,
        bundle_max_messages: i32,
    ) -> BillingResult<QuotaInfo> {
        let mut quota = self.load(user_id).await?;
        quota.renew(subscription_id, bundle_name, bundle_max_messages);
        self.users.update(&quota).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            total = quota.total_remaining_messages,
            "Bundle quota renewed"
        );
        Ok(quota.info())
    }

    /// Reconcile the pool after a subscription expired. With a surviving
    /// subscription the pool is re-attributed to it; otherwise the user
    /// drops to the free tier.
    pub async fn expire_bundle(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        fallback: Option<&Subscription>,
    ) -> BillingResult<QuotaInfo> {
        let mut quota = self.load(user_id).await?;
        let removed = quota.expire(subscription_id);
        match fallback {
            Some(next) => quota.attribute_fallback(next),
            None => quota.shift_to_free_tier(),
        }
        self.users.update(&quota).await?;
        let fallback_label = fallback
            .map(|s| s.id.to_string())
            .unwrap_or_else(|| "free-tier".to_string());
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            removed = removed,
            fallback = %fallback_label,
            total = quota.total_remaining_messages,
            "Bundle quota expired"
        );
        Ok(quota.info())
    }

    pub async fn shift_to_free_tier(&self, user_id: Uuid) -> BillingResult<QuotaInfo> {
        let mut quota = self.load(user_id).await?;
        quota.shift_to_free_tier();
        self.users.update(&quota).await?;
        Ok(quota.info())
    }

    pub async fn reset_free_tier(&self, user_id: Uuid) -> BillingResult<QuotaInfo> {
        let quota = self.users.reset_free_tier(user_id).await?;
        Ok(quota.info())
    }

    /// Monthly batch reset. Returns the number of users touched.
    pub async fn reset_all_free_tier_users(&self) -> BillingResult<u64> {
        let count = self.users.reset_all_free_tier().await?;
        tracing::info!(count = count, "Free tier quotas reset");
        Ok(count)
    }
}
