// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Quota/Subscription Engine
//!
//! Tests critical boundary conditions in:
//! - Quota ledger arithmetic (QUO-01 to QUO-05)
//! - Lifecycle fallback chains (LIF-01 to LIF-06)
//! - Chat metering gate (CHAT-01 to CHAT-03)

#[cfg(test)]
mod quota_edge_tests {
    use crate::test_support::Harness;
    use chatmeter_shared::{BillingCycle, UNLIMITED_QUOTA_SENTINEL};

    // =========================================================================
    // QUO-01: Deduct down to exactly zero, then the next deduct is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_deduct_to_exact_zero_then_reject() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;

        for _ in 0..3 {
            h.ledger.deduct(user_id, 1).await.unwrap();
        }
        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert_eq!(info.total_remaining_messages, 0);
        assert!(!info.has_quota);

        assert!(h.ledger.deduct(user_id, 1).await.is_err());
    }

    // =========================================================================
    // QUO-02: Deduct larger than the pool fails without partial consumption
    // =========================================================================
    #[tokio::test]
    async fn test_oversized_deduct_leaves_pool_untouched() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;

        assert!(h.ledger.deduct(user_id, 5).await.is_err());
        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert_eq!(info.total_remaining_messages, 3);
    }

    // =========================================================================
    // QUO-03: Two purchases stack the pool but attribution follows the newest
    // =========================================================================
    #[tokio::test]
    async fn test_stacked_purchases_attribute_newest() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let pro = h.seed_tier("Pro", 10).await;
        let max = h.seed_tier("Max", 20).await;

        h.service
            .subscribe(user_id, pro.id, BillingCycle::Monthly)
            .await
            .unwrap();
        let second = h
            .service
            .subscribe(user_id, max.id, BillingCycle::Monthly)
            .await
            .unwrap();

        let info = h.ledger.quota_info(user_id).await.unwrap();
        // 3 free + 10 + 20
        assert_eq!(info.total_remaining_messages, 33);
        assert_eq!(info.attributed_bundle_id, Some(second.id));
        assert_eq!(info.attributed_bundle_remaining, Some(20));
    }

    // =========================================================================
    // QUO-04: Upgrading to unlimited replaces the pool with the sentinel
    // =========================================================================
    #[tokio::test]
    async fn test_unlimited_purchase_replaces_pool() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let pro = h.seed_tier("Pro", 10).await;
        let unlimited = h.seed_tier("Unlimited", -1).await;

        h.service
            .subscribe(user_id, pro.id, BillingCycle::Monthly)
            .await
            .unwrap();
        h.service
            .subscribe(user_id, unlimited.id, BillingCycle::Monthly)
            .await
            .unwrap();

        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert!(info.is_unlimited);
        assert_eq!(info.total_remaining_messages, UNLIMITED_QUOTA_SENTINEL);
        assert!(info.has_quota);
    }

    // =========================================================================
    // QUO-05: Manual single-user reset restores the floor mid-month
    // =========================================================================
    #[tokio::test]
    async fn test_single_user_reset_restores_floor() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        h.ledger.deduct(user_id, 2).await.unwrap();

        let info = h.ledger.reset_free_tier(user_id).await.unwrap();
        assert_eq!(info.total_remaining_messages, 3);
    }
}

#[cfg(test)]
mod lifecycle_edge_tests {
    use crate::lifecycle::{ExpiryOutcome, ExpiryReason};
    use crate::payment::FixedPaymentGateway;
    use crate::queue::ExpiryQueue;
    use crate::store::SubscriptionStore;
    use crate::test_support::Harness;
    use chatmeter_shared::{BillingCycle, FREE_TIER_MONTHLY_MESSAGES};
    use std::sync::Arc;

    // =========================================================================
    // LIF-01: Expiring a non-attributed bundle removes nothing from the pool
    // =========================================================================
    #[tokio::test]
    async fn test_non_attributed_expiry_preserves_pool() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let pro = h.seed_tier("Pro", 10).await;
        let max = h.seed_tier("Max", 20).await;

        let first = h
            .service
            .subscribe(user_id, pro.id, BillingCycle::Monthly)
            .await
            .unwrap();
        let second = h
            .service
            .subscribe(user_id, max.id, BillingCycle::Yearly)
            .await
            .unwrap();

        // Attribution sits on `second`; expire `first` with renewal off.
        h.service.toggle_auto_renewal(user_id, first.id).await.unwrap();
        let outcome = h
            .engine
            .process_expiry(first.id, first.end_date)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFallback {
                reason: ExpiryReason::AutoRenewalDisabled,
                fallback_subscription_id: second.id,
            }
        );

        let info = h.ledger.quota_info(user_id).await.unwrap();
        // Nothing removed (first was not attributed); whole pool folds into
        // the surviving bundle's sub-counter.
        assert_eq!(info.total_remaining_messages, 33);
        assert_eq!(info.attributed_bundle_id, Some(second.id));
        assert_eq!(info.attributed_bundle_remaining, Some(33));
    }

    // =========================================================================
    // LIF-02: Sequential expiry of every bundle lands on the free tier floor
    // =========================================================================
    #[tokio::test]
    async fn test_expiry_chain_ends_at_free_tier() {
        let h = Harness::with_payment(Arc::new(FixedPaymentGateway::declining())).await;
        let user_id = h.seed_free_user().await;
        let pro = h.seed_tier("Pro", 10).await;
        let max = h.seed_tier("Max", 20).await;

        let first = h
            .service
            .subscribe(user_id, pro.id, BillingCycle::Monthly)
            .await
            .unwrap();
        let second = h
            .service
            .subscribe(user_id, max.id, BillingCycle::Monthly)
            .await
            .unwrap();

        // Declined payment expires `second` (attributed) onto `first`.
        let outcome = h
            .engine
            .process_expiry(second.id, second.end_date)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFallback {
                reason: ExpiryReason::PaymentDeclined,
                fallback_subscription_id: first.id,
            }
        );
        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert_eq!(info.total_remaining_messages, 13);
        assert!(!info.is_free_tier);

        // Then `first` expires with nothing left to fall back to.
        let outcome = h
            .engine
            .process_expiry(first.id, first.end_date)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFreeTier {
                reason: ExpiryReason::PaymentDeclined
            }
        );
        let info = h.ledger.quota_info(user_id).await.unwrap();
        assert!(info.is_free_tier);
        assert_eq!(info.total_remaining_messages, FREE_TIER_MONTHLY_MESSAGES);
        assert_eq!(info.attributed_bundle_id, None);
    }

    // =========================================================================
    // LIF-03: Fallback picks the survivor closest to its own end date
    // =========================================================================
    #[tokio::test]
    async fn test_fallback_prefers_earliest_end_date() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let a = h.seed_tier("A", 10).await;
        let b = h.seed_tier("B", 20).await;
        let c = h.seed_tier("C", 30).await;

        let monthly = h
            .service
            .subscribe(user_id, a.id, BillingCycle::Monthly)
            .await
            .unwrap();
        let yearly = h
            .service
            .subscribe(user_id, b.id, BillingCycle::Yearly)
            .await
            .unwrap();
        let expiring = h
            .service
            .subscribe(user_id, c.id, BillingCycle::Monthly)
            .await
            .unwrap();

        h.service
            .toggle_auto_renewal(user_id, expiring.id)
            .await
            .unwrap();
        let outcome = h
            .engine
            .process_expiry(expiring.id, expiring.start_date)
            .await
            .unwrap();

        // The monthly survivor ends before the yearly one.
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFallback {
                reason: ExpiryReason::AutoRenewalDisabled,
                fallback_subscription_id: monthly.id,
            }
        );
        let _ = yearly;
    }

    // =========================================================================
    // LIF-04: Renewal replaces the pending task instead of stacking a second
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_keeps_one_pending_task() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);

        h.engine.process_expiry(sub.id, sub.end_date).await.unwrap();
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    }

    // =========================================================================
    // LIF-05: Expiring an unlimited bundle does not leak the sentinel pool
    // =========================================================================
    #[tokio::test]
    async fn test_unlimited_expiry_does_not_leak_sentinel() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let pro = h.seed_tier("Pro", 10).await;
        let unlimited = h.seed_tier("Unlimited", -1).await;

        let capped = h
            .service
            .subscribe(user_id, pro.id, BillingCycle::Yearly)
            .await
            .unwrap();
        let uncapped = h
            .service
            .subscribe(user_id, unlimited.id, BillingCycle::Monthly)
            .await
            .unwrap();

        h.service
            .toggle_auto_renewal(user_id, uncapped.id)
            .await
            .unwrap();
        let outcome = h
            .engine
            .process_expiry(uncapped.id, uncapped.end_date)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExpiryOutcome::ExpiredToFallback {
                reason: ExpiryReason::AutoRenewalDisabled,
                fallback_subscription_id: capped.id,
            }
        );

        let info = h.ledger.quota_info(user_id).await.unwrap();
        // The sentinel pool belonged to the unlimited bundle and leaves with it.
        assert_eq!(info.total_remaining_messages, 0);
        assert!(!info.is_unlimited);
        assert_eq!(info.attributed_bundle_id, Some(capped.id));
    }

    // =========================================================================
    // LIF-06: Overdue sweep surfaces active subscriptions past their end date
    // =========================================================================
    #[tokio::test]
    async fn test_overdue_sweep_finds_stale_subscriptions() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let tier = h.seed_tier("Pro", 10).await;
        let sub = h
            .service
            .subscribe(user_id, tier.id, BillingCycle::Monthly)
            .await
            .unwrap();

        let before_end = sub.end_date - chrono::Duration::days(1);
        assert!(h
            .subscriptions
            .find_overdue(before_end, 10)
            .await
            .unwrap()
            .is_empty());

        let after_end = sub.end_date + chrono::Duration::hours(1);
        let overdue = h.subscriptions.find_overdue(after_end, 10).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, sub.id);

        // Once expired it drops out of the sweep.
        h.service.toggle_auto_renewal(user_id, sub.id).await.unwrap();
        h.engine.process_expiry(sub.id, after_end).await.unwrap();
        assert!(h
            .subscriptions
            .find_overdue(after_end, 10)
            .await
            .unwrap()
            .is_empty());
    }
}

#[cfg(test)]
mod chat_gate_edge_tests {
    use crate::error::BillingError;
    use crate::test_support::Harness;

    // =========================================================================
    // CHAT-01: Free-tier user is cut off at exactly the floor
    // =========================================================================
    #[tokio::test]
    async fn test_free_tier_cut_off_at_floor() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;

        for i in 0..3 {
            let reply = h
                .chat
                .send_message(user_id, &format!("message {i}"))
                .await
                .unwrap();
            assert_eq!(reply.remaining_messages, 2 - i);
        }

        let err = h.chat.send_message(user_id, "one too many").await.unwrap_err();
        assert!(matches!(err, BillingError::QuotaExceeded(_)));
    }

    // =========================================================================
    // CHAT-02: Empty pool after provider failures still counts the spend
    // =========================================================================
    #[tokio::test]
    async fn test_provider_failures_exhaust_quota() {
        use crate::chat::MockChatProvider;
        use std::sync::Arc;

        let h = Harness::with_provider(Arc::new(MockChatProvider::always_failing())).await;
        let user_id = h.seed_free_user().await;

        for _ in 0..3 {
            let reply = h.chat.send_message(user_id, "hello").await.unwrap();
            assert_eq!(reply.message.status, crate::chat::MessageStatus::Failed);
        }
        let err = h.chat.send_message(user_id, "hello").await.unwrap_err();
        assert!(matches!(err, BillingError::QuotaExceeded(_)));

        // All three failed exchanges are in the history.
        let page = h.chat.history(user_id, 1, 20).await.unwrap();
        assert_eq!(page.total, 3);
    }

    // =========================================================================
    // CHAT-03: History pagination clamps oversized limits
    // =========================================================================
    #[tokio::test]
    async fn test_history_clamps_limit() {
        let h = Harness::new().await;
        let user_id = h.seed_free_user().await;
        let page = h.chat.history(user_id, 0, 10_000).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 100);
    }
}
