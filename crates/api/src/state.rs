//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use chatmeter_billing::{BillingService, InvariantChecker};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub invariants: Arc<InvariantChecker>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        let invariants = Arc::new(InvariantChecker::new(pool.clone()));
        Self {
            pool,
            config,
            billing: Arc::new(billing),
            invariants,
        }
    }
}
