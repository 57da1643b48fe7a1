//! Subscription records and user-facing subscription operations

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use chatmeter_shared::BillingCycle;

use crate::catalog::BundleCatalog;
use crate::error::{BillingError, BillingResult};
use crate::queue::{ExpiryQueue, ExpiryTask};
use crate::quota::QuotaLedger;
use crate::store::SubscriptionStore;

/// One purchase of a bundle tier. The `bundle_*` fields are a snapshot taken
/// at purchase time and never re-read from the catalog, so later tier edits
/// cannot change what an existing subscriber paid for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bundle_tier_id: Uuid,
    pub bundle_name: String,
    pub bundle_max_messages: i32,
    pub bundle_price_cents: i64,
    pub billing_cycle: BillingCycle,
    pub auto_renewal: bool,
    /// Active flag. Flipped off by expiry or cancellation, never deleted.
    pub status: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub renewal_date: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status && self.cancelled_at.is_none() && self.end_date > now
    }

    pub fn is_unlimited(&self) -> bool {
        self.bundle_max_messages == chatmeter_shared::UNLIMITED_MAX_MESSAGES
    }
}

/// Subscribe/cancel/toggle/list operations.
#[derive(Clone)]
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn BundleCatalog>,
    ledger: QuotaLedger,
    queue: Arc<dyn ExpiryQueue>,
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn BundleCatalog>,
        ledger: QuotaLedger,
        queue: Arc<dyn ExpiryQueue>,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            ledger,
            queue,
        }
    }

    /// Purchase a bundle: creates the subscription record, grants its quota,
    /// and schedules the expiry task for the end date.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        bundle_tier_id: Uuid,
        billing_cycle: BillingCycle,
    ) -> BillingResult<Subscription> {
        let tier = self
            .catalog
            .get(bundle_tier_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("bundle tier {bundle_tier_id}")))?;

        if !tier.is_available() {
            return Err(BillingError::validation(
                "inactive_bundle_tier",
                "This bundle tier is no longer available",
            ));
        }

        let now = Utc::now();
        if self
            .subscriptions
            .find_active_by_user_and_tier(user_id, bundle_tier_id, now)
            .await?
            .is_some()
        {
            return Err(BillingError::validation(
                "duplicate_subscription",
                "You already have an active subscription for this bundle tier",
            ));
        }

        let end_date = billing_cycle.advance(now);
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id,
            bundle_tier_id,
            bundle_name: tier.name.clone(),
            bundle_max_messages: tier.max_messages,
            bundle_price_cents: tier.price_cents_for(billing_cycle),
            billing_cycle,
            auto_renewal: true,
            status: true,
            start_date: now,
            end_date,
            renewal_date: end_date,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };

        self.subscriptions.insert(&subscription).await?;
        self.ledger
            .grant_bundle(user_id, subscription.id, &tier.name, tier.max_messages)
            .await?;
        self.queue
            .schedule(ExpiryTask {
                subscription_id: subscription.id,
                user_id,
                run_at: end_date,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            bundle = %tier.name,
            cycle = %billing_cycle,
            end_date = %end_date,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// User-initiated cancellation. Deactivates immediately but does not
    /// touch quota; the already-scheduled expiry task observes the inactive
    /// row and no-ops.
    pub async fn cancel(&self, user_id: Uuid, subscription_id: Uuid) -> BillingResult<Subscription> {
        let mut subscription = self.find_owned(user_id, subscription_id, "cancel").await?;

        if subscription.cancelled_at.is_some() {
            return Err(BillingError::validation(
                "already_cancelled",
                "This subscription has already been cancelled",
            ));
        }

        let now = Utc::now();
        subscription.status = false;
        subscription.auto_renewal = false;
        subscription.cancelled_at = Some(now);
        subscription.updated_at = now;
        self.subscriptions.update(&subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Subscription cancelled"
        );
        Ok(subscription)
    }

    pub async fn toggle_auto_renewal(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.find_owned(user_id, subscription_id, "modify").await?;

        if subscription.cancelled_at.is_some() {
            return Err(BillingError::validation(
                "subscription_cancelled",
                "Cannot modify a cancelled subscription",
            ));
        }

        subscription.auto_renewal = !subscription.auto_renewal;
        subscription.updated_at = Utc::now();
        self.subscriptions.update(&subscription).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            auto_renewal = subscription.auto_renewal,
            "Auto-renewal toggled"
        );
        Ok(subscription)
    }

    pub async fn list(&self, user_id: Uuid, active_only: bool) -> BillingResult<Vec<Subscription>> {
        if active_only {
            self.subscriptions
                .find_active_by_user(user_id, Utc::now())
                .await
        } else {
            self.subscriptions.find_by_user(user_id).await
        }
    }

    async fn find_owned(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        verb: &str,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .subscriptions
            .find_by_id(subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("subscription {subscription_id}")))?;

        if subscription.user_id != user_id {
            return Err(BillingError::Forbidden(format!(
                "You do not have permission to {verb} this subscription"
            )));
        }
        Ok(subscription)
    }
}
