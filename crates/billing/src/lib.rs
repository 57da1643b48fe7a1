// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Chatmeter Billing Module
//!
//! The quota/subscription lifecycle engine behind the metered chat product.
//!
//! ## Features
//!
//! - **Quota Ledger**: per-user remaining-message pool with an attributed
//!   bundle pointer, atomic deduction, unlimited sentinel handling
//! - **Bundle Catalog**: read-only tier lookup with purchase-time snapshots
//! - **Subscriptions**: subscribe, cancel, toggle auto-renewal, list
//! - **Lifecycle Engine**: renew-or-expire state machine driven by delayed
//!   expiry tasks, with multi-bundle fallback and free-tier shift
//! - **Free-Tier Reset**: monthly floor reset for unsubscribed users
//! - **Chat Metering Gate**: check-and-deduct in front of the chat provider
//! - **Invariants**: runnable consistency checks over the quota schema

pub mod catalog;
pub mod chat;
pub mod error;
pub mod invariants;
pub mod lifecycle;
pub mod memory;
pub mod payment;
pub mod postgres;
pub mod queue;
pub mod quota;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod test_support;

// Catalog
pub use catalog::{BundleCatalog, BundleTier};

// Chat
pub use chat::{
    ChatCompletion, ChatHistoryPage, ChatMessage, ChatOutcome, ChatProvider, ChatReply,
    ChatService, MessageStatus, MockChatProvider, TokenUsage,
};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{decide, Decision, ExpiryOutcome, ExpiryReason, LifecycleEngine};

// Payment
pub use payment::{FixedPaymentGateway, PaymentGateway, PaymentOutcome, SimulatedPaymentGateway};

// Queue
pub use queue::{ExpiryQueue, ExpiryTask, InMemoryExpiryQueue, RedisExpiryQueue};

// Quota
pub use quota::{QuotaInfo, QuotaLedger, UserQuota, FREE_TIER_BUNDLE_NAME};

// Stores
pub use store::{ChatMessageStore, SubscriptionStore, UserQuotaStore};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionService};

use std::sync::Arc;

use sqlx::PgPool;

/// Handles to the persistent stores behind the engine.
#[derive(Clone)]
pub struct BillingStores {
    pub users: Arc<dyn UserQuotaStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub messages: Arc<dyn ChatMessageStore>,
    pub catalog: Arc<dyn BundleCatalog>,
}

impl BillingStores {
    /// Postgres-backed stores sharing one pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: Arc::new(postgres::PgUserQuotaStore::new(pool.clone())),
            subscriptions: Arc::new(postgres::PgSubscriptionStore::new(pool.clone())),
            messages: Arc::new(postgres::PgChatMessageStore::new(pool.clone())),
            catalog: Arc::new(postgres::PgBundleCatalog::new(pool)),
        }
    }

    /// Process-local stores for tests and development runs.
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(memory::InMemoryUserQuotaStore::new()),
            subscriptions: Arc::new(memory::InMemorySubscriptionStore::new()),
            messages: Arc::new(memory::InMemoryChatMessageStore::new()),
            catalog: Arc::new(memory::InMemoryBundleCatalog::new()),
        }
    }
}

/// Main billing service that combines all quota/subscription functionality.
#[derive(Clone)]
pub struct BillingService {
    pub ledger: QuotaLedger,
    pub subscriptions: SubscriptionService,
    pub lifecycle: LifecycleEngine,
    pub chat: ChatService,
    pub catalog: Arc<dyn BundleCatalog>,
    pub subscription_store: Arc<dyn SubscriptionStore>,
}

impl BillingService {
    pub fn new(
        stores: BillingStores,
        queue: Arc<dyn ExpiryQueue>,
        payment: Arc<dyn PaymentGateway>,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        let ledger = QuotaLedger::new(stores.users.clone());
        let subscriptions = SubscriptionService::new(
            stores.subscriptions.clone(),
            stores.catalog.clone(),
            ledger.clone(),
            queue.clone(),
        );
        let lifecycle = LifecycleEngine::new(
            stores.subscriptions.clone(),
            ledger.clone(),
            payment,
            queue,
        );
        let chat = ChatService::new(ledger.clone(), stores.messages.clone(), provider);

        Self {
            ledger,
            subscriptions,
            lifecycle,
            chat,
            catalog: stores.catalog,
            subscription_store: stores.subscriptions,
        }
    }

    /// Production wiring: Postgres stores, the given queue, the stochastic
    /// payment simulation, and the mock chat provider.
    pub fn postgres(pool: PgPool, queue: Arc<dyn ExpiryQueue>) -> Self {
        Self::new(
            BillingStores::postgres(pool),
            queue,
            Arc::new(SimulatedPaymentGateway::default()),
            Arc::new(MockChatProvider::new()),
        )
    }
}
