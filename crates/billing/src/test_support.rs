//! Shared fixtures for the crate's test suite

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::catalog::BundleTier;
use crate::chat::{ChatProvider, ChatService, MockChatProvider};
use crate::lifecycle::LifecycleEngine;
use crate::memory::{
    InMemoryBundleCatalog, InMemoryChatMessageStore, InMemorySubscriptionStore,
    InMemoryUserQuotaStore,
};
use crate::payment::{FixedPaymentGateway, PaymentGateway};
use crate::queue::InMemoryExpiryQueue;
use crate::quota::{QuotaLedger, UserQuota};
use crate::store::UserQuotaStore;
use crate::subscriptions::SubscriptionService;

/// Fully wired engine over in-memory stores, with an approving payment
/// gateway and an instant provider unless overridden.
pub struct Harness {
    pub users: Arc<InMemoryUserQuotaStore>,
    pub subscriptions: Arc<InMemorySubscriptionStore>,
    pub messages: Arc<InMemoryChatMessageStore>,
    pub catalog: Arc<InMemoryBundleCatalog>,
    pub queue: Arc<InMemoryExpiryQueue>,
    pub ledger: QuotaLedger,
    pub service: SubscriptionService,
    pub engine: LifecycleEngine,
    pub chat: ChatService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(
            Arc::new(FixedPaymentGateway::approving()),
            Arc::new(MockChatProvider::instant()),
        )
    }

    pub async fn with_payment(payment: Arc<dyn PaymentGateway>) -> Self {
        Self::build(payment, Arc::new(MockChatProvider::instant()))
    }

    pub async fn with_provider(provider: Arc<dyn ChatProvider>) -> Self {
        Self::build(Arc::new(FixedPaymentGateway::approving()), provider)
    }

    fn build(payment: Arc<dyn PaymentGateway>, provider: Arc<dyn ChatProvider>) -> Self {
        let users = Arc::new(InMemoryUserQuotaStore::new());
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        let messages = Arc::new(InMemoryChatMessageStore::new());
        let catalog = Arc::new(InMemoryBundleCatalog::new());
        let queue = Arc::new(InMemoryExpiryQueue::new());

        let ledger = QuotaLedger::new(users.clone());
        let service = SubscriptionService::new(
            subscriptions.clone(),
            catalog.clone(),
            ledger.clone(),
            queue.clone(),
        );
        let engine = LifecycleEngine::new(
            subscriptions.clone(),
            ledger.clone(),
            payment,
            queue.clone(),
        );
        let chat = ChatService::new(ledger.clone(), messages.clone(), provider);

        Self {
            users,
            subscriptions,
            messages,
            catalog,
            queue,
            ledger,
            service,
            engine,
            chat,
        }
    }

    /// Insert a fresh free-tier user and return its id.
    pub async fn seed_free_user(&self) -> Uuid {
        let quota = UserQuota::new_free_tier(Uuid::new_v4());
        let user_id = quota.user_id;
        self.users.insert(&quota).await.unwrap();
        user_id
    }

    /// Insert an active bundle tier.
    pub async fn seed_tier(&self, name: &str, max_messages: i32) -> BundleTier {
        let now = Utc::now();
        let tier = BundleTier {
            id: Uuid::new_v4(),
            name: name.to_string(),
            max_messages,
            price_monthly_cents: 999,
            price_yearly_cents: 9990,
            is_active: true,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.catalog.upsert(tier.clone()).await;
        tier
    }

    /// Edit a user's quota row in place.
    pub async fn set_quota(&self, user_id: Uuid, apply: impl FnOnce(&mut UserQuota)) {
        let mut quota = self.users.get(user_id).await.unwrap().unwrap();
        apply(&mut quota);
        self.users.update(&quota).await.unwrap();
    }
}
