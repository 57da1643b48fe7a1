//! Quota Invariants Module
//!
//! Provides runnable consistency checks for the quota/subscription system.
//! These invariants can be run after any lifecycle event or batch job to
//! ensure the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may be metered incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: DateTime<Utc>,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for negative-quota violation
#[derive(Debug, sqlx::FromRow)]
struct NegativeQuotaRow {
    user_id: Uuid,
    total_remaining_messages: i32,
}

/// Row type for free-tier-with-attribution violation
#[derive(Debug, sqlx::FromRow)]
struct FreeTierAttributedRow {
    user_id: Uuid,
    attributed_bundle_id: Uuid,
}

/// Row type for sub-counter-exceeds-pool violation
#[derive(Debug, sqlx::FromRow)]
struct SubCounterOverflowRow {
    user_id: Uuid,
    total_remaining_messages: i32,
    attributed_remaining: i32,
}

/// Row type for attribution-points-at-inactive-subscription violation
#[derive(Debug, sqlx::FromRow)]
struct StaleAttributionRow {
    user_id: Uuid,
    subscription_id: Uuid,
    status: bool,
}

/// Row type for cancelled-but-active violation
#[derive(Debug, sqlx::FromRow)]
struct CancelledActiveRow {
    subscription_id: Uuid,
    user_id: Uuid,
    cancelled_at: Option<DateTime<Utc>>,
}

/// Row type for duplicate active subscription violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateActiveRow {
    user_id: Uuid,
    bundle_tier_id: Uuid,
    sub_count: i64,
}

/// Service for running quota invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = Utc::now();
        let mut violations = Vec::new();

        violations.extend(self.check_quota_non_negative().await?);
        violations.extend(self.check_free_tier_unattributed().await?);
        violations.extend(self.check_sub_counter_within_pool().await?);
        violations.extend(self.check_attribution_points_at_active().await?);
        violations.extend(self.check_cancelled_is_inactive().await?);
        violations.extend(self.check_no_duplicate_active_subscription().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: The remaining-message pool never goes negative
    ///
    /// A negative pool means a deduction bypassed the conditional guard and
    /// the user is being metered incorrectly.
    async fn check_quota_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeQuotaRow> = sqlx::query_as(
            r#"
            SELECT id AS user_id, total_remaining_messages
            FROM users
            WHERE total_remaining_messages < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "quota_non_negative".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} remaining messages (expected >= 0)",
                    row.total_remaining_messages
                ),
                context: serde_json::json!({
                    "total_remaining_messages": row.total_remaining_messages,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Free-tier users carry no bundle attribution
    ///
    /// `is_free_tier` means "no attributed paid bundle"; a dangling
    /// attribution id makes expiry netting subtract from the wrong pool.
    async fn check_free_tier_unattributed(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FreeTierAttributedRow> = sqlx::query_as(
            r#"
            SELECT id AS user_id, attributed_bundle_id
            FROM users
            WHERE is_free_tier = TRUE
              AND attributed_bundle_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_tier_unattributed".to_string(),
                user_ids: vec![row.user_id],
                description: "Free-tier user still has an attributed bundle".to_string(),
                context: serde_json::json!({
                    "attributed_bundle_id": row.attributed_bundle_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: The attributed sub-counter fits inside the pool
    ///
    /// The attributed bundle's remainder is a portion of the aggregate pool;
    /// it exceeding the pool means a grant or fallback fold went wrong.
    /// Unlimited users (attributed max = -1) are exempt.
    async fn check_sub_counter_within_pool(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubCounterOverflowRow> = sqlx::query_as(
            r#"
            SELECT id AS user_id, total_remaining_messages, attributed_remaining
            FROM users
            WHERE attributed_bundle_id IS NOT NULL
              AND attributed_bundle_max_messages <> -1
              AND attributed_remaining > total_remaining_messages
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "sub_counter_within_pool".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Attributed remainder {} exceeds total pool {}",
                    row.attributed_remaining, row.total_remaining_messages
                ),
                context: serde_json::json!({
                    "total_remaining_messages": row.total_remaining_messages,
                    "attributed_remaining": row.attributed_remaining,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: Attribution points at an active subscription
    ///
    /// The expire transition must either re-attribute or shift the user to
    /// the free tier; a pointer at an inactive subscription means it did
    /// neither.
    async fn check_attribution_points_at_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleAttributionRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, s.id AS subscription_id, s.status
            FROM users u
            JOIN subscriptions s ON s.id = u.attributed_bundle_id
            WHERE s.status = FALSE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "attribution_points_at_active".to_string(),
                user_ids: vec![row.user_id],
                description: "Attributed bundle references an inactive subscription".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "subscription_status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Cancelled subscriptions are inactive
    ///
    /// Cancellation sets `status = false` synchronously; a cancelled row
    /// that is still active would be picked up as a fallback bundle.
    async fn check_cancelled_is_inactive(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledActiveRow> = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, user_id, cancelled_at
            FROM subscriptions
            WHERE cancelled_at IS NOT NULL
              AND status = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_is_inactive".to_string(),
                user_ids: vec![row.user_id],
                description: "Cancelled subscription is still marked active".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "cancelled_at": row.cancelled_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: No duplicate active subscription per (user, tier)
    ///
    /// The subscribe operation rejects duplicates; more than one active
    /// subscription for the same bundle tier means the check was bypassed.
    async fn check_no_duplicate_active_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, bundle_tier_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status = TRUE
              AND cancelled_at IS NULL
              AND end_date > NOW()
            GROUP BY user_id, bundle_tier_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_duplicate_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions for the same bundle tier (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "bundle_tier_id": row.bundle_tier_id,
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "quota_non_negative" => self.check_quota_non_negative().await,
            "free_tier_unattributed" => self.check_free_tier_unattributed().await,
            "sub_counter_within_pool" => self.check_sub_counter_within_pool().await,
            "attribution_points_at_active" => self.check_attribution_points_at_active().await,
            "cancelled_is_inactive" => self.check_cancelled_is_inactive().await,
            "no_duplicate_active_subscription" => {
                self.check_no_duplicate_active_subscription().await
            }
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "quota_non_negative",
            "free_tier_unattributed",
            "sub_counter_within_pool",
            "attribution_points_at_active",
            "cancelled_is_inactive",
            "no_duplicate_active_subscription",
        ]
    }
}
