//! Bundle tier catalog
//!
//! Read-only lookup of purchasable message bundles. Tier rows are mutated by
//! admin tooling outside this crate; subscriptions snapshot the fields they
//! need at purchase time, so later catalog edits never affect existing
//! subscriptions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use chatmeter_shared::{BillingCycle, UNLIMITED_MAX_MESSAGES};

use crate::error::BillingResult;

/// A purchasable plan: message allowance plus monthly/yearly pricing.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BundleTier {
    pub id: Uuid,
    pub name: String,
    /// Message allowance per billing period; -1 means uncapped.
    pub max_messages: i32,
    pub price_monthly_cents: i64,
    pub price_yearly_cents: i64,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BundleTier {
    pub fn is_unlimited(&self) -> bool {
        self.max_messages == UNLIMITED_MAX_MESSAGES
    }

    /// Whether the tier can currently be subscribed to.
    pub fn is_available(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    pub fn price_cents_for(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.price_monthly_cents,
            BillingCycle::Yearly => self.price_yearly_cents,
        }
    }
}

/// Catalog lookups consumed by the subscription operations.
#[async_trait]
pub trait BundleCatalog: Send + Sync {
    async fn get(&self, id: Uuid) -> BillingResult<Option<BundleTier>>;

    async fn list_active(&self) -> BillingResult<Vec<BundleTier>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(max_messages: i32) -> BundleTier {
        BundleTier {
            id: Uuid::new_v4(),
            name: "Starter".to_string(),
            max_messages,
            price_monthly_cents: 999,
            price_yearly_cents: 9990,
            is_active: true,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn unlimited_marker_is_minus_one() {
        assert!(tier(-1).is_unlimited());
        assert!(!tier(100).is_unlimited());
    }

    #[test]
    fn price_follows_billing_cycle() {
        let t = tier(100);
        assert_eq!(t.price_cents_for(BillingCycle::Monthly), 999);
        assert_eq!(t.price_cents_for(BillingCycle::Yearly), 9990);
    }

    #[test]
    fn soft_deleted_tier_is_not_available() {
        let mut t = tier(100);
        assert!(t.is_available());
        t.deleted_at = Some(Utc::now());
        assert!(!t.is_available());
    }
}
