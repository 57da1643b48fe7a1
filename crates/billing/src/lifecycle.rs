//! Subscription lifecycle engine
//!
//! Drives the expiry-time state machine: when a subscription's expiry task
//! fires, the subscription is either renewed (simulated payment approved,
//! dates pushed one billing period forward, quota re-granted, next task
//! scheduled) or expired (deactivated, its attributed quota removed, the
//! user re-attributed to a surviving subscription or shifted to the free
//! tier).
//!
//! The transition itself is the pure [`decide`] function of (subscription,
//! now, payment outcome); [`LifecycleEngine::process_expiry`] wraps it with
//! the fetch/persist/schedule effects and the idempotence guard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::payment::{PaymentGateway, PaymentOutcome};
use crate::queue::{ExpiryQueue, ExpiryTask};
use crate::quota::QuotaLedger;
use crate::store::SubscriptionStore;
use crate::subscriptions::Subscription;

/// Why a subscription went down the expire path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    AutoRenewalDisabled,
    PaymentDeclined,
}

impl std::fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryReason::AutoRenewalDisabled => write!(f, "auto-renewal disabled"),
            ExpiryReason::PaymentDeclined => write!(f, "payment declined"),
        }
    }
}

/// Pure transition decision for an expiry-task firing.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Renew { new_end: DateTime<Utc> },
    Expire { reason: ExpiryReason },
}

/// Decide what happens to an active subscription whose end date arrived.
/// `payment` is the outcome of the charge attempt, `None` when no charge was
/// attempted because auto-renewal is off.
pub fn decide(
    subscription: &Subscription,
    now: DateTime<Utc>,
    payment: Option<&PaymentOutcome>,
) -> Decision {
    if !subscription.auto_renewal {
        return Decision::Expire {
            reason: ExpiryReason::AutoRenewalDisabled,
        };
    }
    match payment {
        Some(PaymentOutcome::Approved { .. }) => Decision::Renew {
            new_end: subscription.billing_cycle.advance(now),
        },
        Some(PaymentOutcome::Declined { .. }) => Decision::Expire {
            reason: ExpiryReason::PaymentDeclined,
        },
        // Auto-renewal on but no charge attempted: treat as disabled rather
        // than renewing for free.
        None => Decision::Expire {
            reason: ExpiryReason::AutoRenewalDisabled,
        },
    }
}

/// What `process_expiry` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExpiryOutcome {
    /// Task observed a missing or already-inactive subscription.
    Skipped { reason: &'static str },
    Renewed {
        new_end_date: DateTime<Utc>,
    },
    ExpiredToFallback {
        reason: ExpiryReason,
        fallback_subscription_id: Uuid,
    },
    ExpiredToFreeTier {
        reason: ExpiryReason,
    },
}

#[derive(Clone)]
pub struct LifecycleEngine {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: QuotaLedger,
    payment: Arc<dyn PaymentGateway>,
    queue: Arc<dyn ExpiryQueue>,
}

impl LifecycleEngine {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: QuotaLedger,
        payment: Arc<dyn PaymentGateway>,
        queue: Arc<dyn ExpiryQueue>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            payment,
            queue,
        }
    }

    /// Handle one expiry-task firing. Safe to call more than once for the
    /// same subscription: a task that finds the row missing or inactive does
    /// nothing.
    pub async fn process_expiry(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<ExpiryOutcome> {
        let Some(subscription) = self.subscriptions.find_by_id(subscription_id).await? else {
            tracing::warn!(subscription_id = %subscription_id, "Expiry task for unknown subscription, skipping");
            return Ok(ExpiryOutcome::Skipped {
                reason: "subscription not found",
            });
        };
        if !subscription.status {
            tracing::debug!(subscription_id = %subscription_id, "Subscription already inactive, skipping");
            return Ok(ExpiryOutcome::Skipped {
                reason: "subscription already inactive",
            });
        }

        let payment = if subscription.auto_renewal {
            Some(
                self.payment
                    .charge(
                        subscription.user_id,
                        subscription.bundle_price_cents,
                        &format!("Renewal of {}", subscription.bundle_name),
                    )
                    .await,
            )
        } else {
            None
        };

        match decide(&subscription, now, payment.as_ref()) {
            Decision::Renew { new_end } => self.renew(subscription, new_end).await,
            Decision::Expire { reason } => self.expire(subscription, now, reason).await,
        }
    }

    async fn renew(
        &self,
        mut subscription: Subscription,
        new_end: DateTime<Utc>,
    ) -> BillingResult<ExpiryOutcome> {
        subscription.end_date = new_end;
        subscription.renewal_date = new_end;
        subscription.updated_at = Utc::now();
        self.subscriptions.update(&subscription).await?;

        self.ledger
            .renew_bundle(
                subscription.user_id,
                subscription.id,
                &subscription.bundle_name,
                subscription.bundle_max_messages,
            )
            .await?;

        self.queue
            .schedule(ExpiryTask {
                subscription_id: subscription.id,
                user_id: subscription.user_id,
                run_at: new_end,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            bundle = %subscription.bundle_name,
            new_end_date = %new_end,
            "Subscription renewed"
        );
        Ok(ExpiryOutcome::Renewed {
            new_end_date: new_end,
        })
    }

    async fn expire(
        &self,
        mut subscription: Subscription,
        now: DateTime<Utc>,
        reason: ExpiryReason,
    ) -> BillingResult<ExpiryOutcome> {
        subscription.status = false;
        subscription.auto_renewal = false;
        subscription.updated_at = Utc::now();
        self.subscriptions.update(&subscription).await?;

        let mut survivors = self
            .subscriptions
            .find_active_by_user(subscription.user_id, now)
            .await?;
        survivors.retain(|s| s.id != subscription.id);
        // The pool falls back to the bundle that will be reconciled next.
        survivors.sort_by_key(|s| s.end_date);
        let fallback = survivors.first();

        self.ledger
            .expire_bundle(subscription.user_id, subscription.id, fallback)
            .await?;

        match fallback {
            Some(next) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    reason = %reason,
                    fallback_subscription_id = %next.id,
                    "Subscription expired, quota re-attributed to surviving bundle"
                );
                Ok(ExpiryOutcome::ExpiredToFallback {
                    reason,
                    fallback_subscription_id: next.id,
                })
            }
            None => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    reason = %reason,
                    "Subscription expired, user shifted to free tier"
                );
                Ok(ExpiryOutcome::ExpiredToFreeTier { reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::payment::FixedPaymentGateway;
    use crate::test_support::Harness;
    use chatmeter_shared::{BillingCycle, FREE_TIER_MONTHLY_MESSAGES};

    fn active_subscription(user_id: Uuid, cycle: BillingCycle) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            bundle_tier_id: Uuid::new_v4(),
            bundle_name: "Pro".to_string(),
            bundle_max_messages: 10,
            bundle_price_cents: 999,
            billing_cycle: cycle,
            auto_renewal: true,
            status: true,
            start_date: now,
            end_date: now,
            renewal_date: now,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn decide_disabled_auto_renewal_expires() {
        let sub = Subscription {
            auto_renewal: false,
            ..active_subscription(Uuid::new_v4(), BillingCycle::Monthly)
        };
        assert_eq!(
            decide(&sub, Utc::now(), None),
            Decision::Expire {
                reason: ExpiryReason::AutoRenewalDisabled
            }
        );
    }

    #[test]
    fn decide_approved_payment_renews_one_period_from_now() {
        let sub = active_subscription(Uuid::new_v4(), BillingCycle::Yearly);
        let now = Utc::now();
        let outcome = PaymentOutcome::Approved {
            reference: "ref".to_string(),
        };
        assert_eq!(
            decide(&sub, now, Some(&outcome)),
            Decision::Renew {
                new_end: BillingCycle::Yearly.advance(now)
            }
        );
    }

    #[test]
    fn decide_declined_payment_expires() {
        let sub = active_subscription(Uuid::new_v4(), BillingCycle::Monthly);
        let outcome = PaymentOutcome::Declined {
            reason: "no funds".to_string(),
        };
        assert_eq!(
            decide(&sub, Utc::now(), Some(&outcome)),
            Decision::Expire {
                reason: ExpiryReason::PaymentDeclined
            }
        );
    }

    #[tokio::test]
    async fn expiry_of_unknown_subscription_is_skipped() {
        let h = Harness::new().await;
        let outcome = h
            .engine
            .process_expiry(Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, ExpiryOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn expiry_is_idempotent_for_inactive_subscription() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();

        let first = h.engine.process_expiry(sub.id, sub.end_date).await.unwrap();
        assert!(matches!(first, ExpiryOutcome::Renewed { .. }));

        // Deactivate, then fire the (now stale) task twice more.
        h.service.cancel(user_id, sub.id).await.unwrap();
        let quota_before = h.ledger.quota_info(user_id).await.unwrap();
        for _ in 0..2 {
            let outcome = h.engine.process_expiry(sub.id, Utc::now()).await.unwrap();
            assert_eq!(
                outcome,
                ExpiryOutcome::Skipped {
                    reason: "subscription already inactive"
                }
            );
        }
        assert_eq!(h.ledger.quota_info(user_id).await.unwrap(), quota_before);
    }

    #[tokio::test]
    async fn renewal_success_advances_dates_and_nets_quota() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();

        // Consume 5 of the attributed 10: pool 13 -> 8, attributed 10 -> 5.
        for _ in 0..5 {
            h.ledger.deduct(user_id, 1).await.unwrap();
        }

        let fired_at = sub.end_date;
        let outcome = h.engine.process_expiry(sub.id, fired_at).await.unwrap();
        let expected_end = BillingCycle::Monthly.advance(fired_at);
        assert_eq!(
            outcome,
            ExpiryOutcome::Renewed {
                new_end_date: expected_end
            }
        );

        let renewed = h.subscriptions.find_by_id(sub.id).await.unwrap().unwrap();
        assert!(renewed.status);
        assert_eq!(renewed.end_date, expected_end);
        assert_eq!(renewed.renewal_date, expected_end);

        // 8 - 5 stale attributed remainder + 10 fresh = 13
        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert_eq!(info.total_remaining_messages, 13);
        assert_eq!(info.attributed_bundle_remaining, Some(10));

        // The next expiry task is scheduled for the new end date.
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
        let tasks = h.queue.due(expected_end, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].subscription_id, sub.id);
        assert_eq!(tasks[0].run_at, expected_end);
    }

    #[tokio::test]
    async fn fallback_to_other_active_bundle_on_expiry() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let tier_a = h.seed_tier("Bundle A", 10).await;
        let tier_b = h.seed_tier("Bundle B", 20).await;

        let sub_a = h
            .service
            .subscribe(user_id, tier_a.id, BillingCycle::Monthly)
            .await
            .unwrap();
        let sub_b = h
            .service
            .subscribe(user_id, tier_b.id, BillingCycle::Yearly)
            .await
            .unwrap();

        // B is attributed (newest grant); re-point attribution at A with 5
        // remaining out of a 25-message pool, as if A were the live bundle.
        h.set_quota(user_id, |q| {
            q.total_remaining_messages = 25;
            q.attributed_bundle_id = Some(sub_a.id);
            q.attributed_remaining = 5;
            q.attributed_bundle_name = Some(sub_a.bundle_name.clone());
            q.attributed_bundle_max_messages = Some(sub_a.bundle_max_messages);
        })
        .await;

        // Auto-renewal off: the expiry task takes the expire path.
        h.service.toggle_auto_renewal(user_id, sub_a.id).await.unwrap();
        let outcome = h
            .engine
            .process_expiry(sub_a.id, sub_a.end_date)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFallback {
                reason: ExpiryReason::AutoRenewalDisabled,
                fallback_subscription_id: sub_b.id,
            }
        );

        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert_eq!(info.total_remaining_messages, 20);
        assert_eq!(info.attributed_bundle_id, Some(sub_b.id));
        assert_eq!(info.attributed_bundle_remaining, Some(20));
        assert!(!info.is_free_tier);

        let expired = h.subscriptions.find_by_id(sub_a.id).await.unwrap().unwrap();
        assert!(!expired.status);
        assert!(!expired.auto_renewal);
    }

    #[tokio::test]
    async fn terminal_expiry_shifts_to_free_tier() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();
        h.set_quota(user_id, |q| {
            q.total_remaining_messages = 10;
            q.attributed_remaining = 10;
        })
        .await;

        h.service.toggle_auto_renewal(user_id, sub.id).await.unwrap();
        let outcome = h.engine.process_expiry(sub.id, sub.end_date).await.unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFreeTier {
                reason: ExpiryReason::AutoRenewalDisabled
            }
        );

        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert!(info.is_free_tier);
        assert_eq!(
            info.total_remaining_messages,
            FREE_TIER_MONTHLY_MESSAGES
        );
        assert_eq!(info.attributed_bundle_id, None);
    }

    #[tokio::test]
    async fn declined_payment_takes_expire_path() {
        let h = Harness::with_payment(Arc::new(FixedPaymentGateway::declining())).await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();

        let outcome = h.engine.process_expiry(sub.id, sub.end_date).await.unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFreeTier {
                reason: ExpiryReason::PaymentDeclined
            }
        );

        let expired = h.subscriptions.find_by_id(sub.id).await.unwrap().unwrap();
        assert!(!expired.status);
        assert!(!expired.auto_renewal);

        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert!(info.is_free_tier);
        assert_eq!(info.total_remaining_messages, FREE_TIER_MONTHLY_MESSAGES);
    }

    #[tokio::test]
    async fn declined_payment_never_propagates_as_error() {
        let h = Harness::with_payment(Arc::new(FixedPaymentGateway::declining())).await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();

        let result: Result<_, BillingError> =
            h.engine.process_expiry(sub.id, sub.end_date).await;
        assert!(result.is_ok());
    }
}
