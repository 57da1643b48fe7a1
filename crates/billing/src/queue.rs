//! Delayed expiry task queue
//!
//! One pending task per subscription, keyed by subscription id: scheduling
//! again (e.g. after a successful renewal) replaces the previous run time
//! instead of stacking a second task. Delivery is at-least-once; the
//! lifecycle engine re-checks subscription state before acting, so a late or
//! duplicate task is a no-op.
//!
//! The Redis implementation keeps the schedule in a sorted set (score =
//! run-at epoch seconds) with task payloads in a companion hash.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// A unit of scheduled work: process this subscription's expiry at `run_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryTask {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub run_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExpiryQueue: Send + Sync {
    /// Schedule (or re-schedule) the expiry task for a subscription.
    async fn schedule(&self, task: ExpiryTask) -> BillingResult<()>;

    /// Remove and return up to `limit` tasks whose run time has arrived,
    /// soonest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> BillingResult<Vec<ExpiryTask>>;

    async fn pending_count(&self) -> BillingResult<usize>;
}

const SCHEDULE_KEY: &str = "chatmeter:expiry:schedule";
const PAYLOAD_KEY: &str = "chatmeter:expiry:payload";

/// Redis-backed queue shared between the API server (producers) and the
/// worker (consumer).
#[derive(Clone)]
pub struct RedisExpiryQueue {
    conn: ConnectionManager,
}

impl RedisExpiryQueue {
    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis expiry queue");
        Ok(Self { conn })
    }
}

#[async_trait]
impl ExpiryQueue for RedisExpiryQueue {
    async fn schedule(&self, task: ExpiryTask) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let member = task.subscription_id.to_string();
        let payload = serde_json::to_string(&task)?;

        let _: () = conn
            .zadd(SCHEDULE_KEY, &member, task.run_at.timestamp())
            .await?;
        let _: () = conn.hset(PAYLOAD_KEY, &member, payload).await?;

        tracing::debug!(
            subscription_id = %task.subscription_id,
            run_at = %task.run_at,
            "Expiry task scheduled"
        );
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> BillingResult<Vec<ExpiryTask>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(SCHEDULE_KEY, "-inf", now.timestamp(), 0, limit as isize)
            .await?;

        let mut tasks = Vec::with_capacity(members.len());
        for member in members {
            // ZREM acts as the claim: another worker that removed the member
            // first owns the task.
            let removed: i64 = conn.zrem(SCHEDULE_KEY, &member).await?;
            if removed == 0 {
                continue;
            }
            let payload: Option<String> = conn.hget(PAYLOAD_KEY, &member).await?;
            let _: i64 = conn.hdel(PAYLOAD_KEY, &member).await?;
            if let Some(payload) = payload {
                tasks.push(serde_json::from_str(&payload)?);
            }
        }
        Ok(tasks)
    }

    async fn pending_count(&self) -> BillingResult<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(SCHEDULE_KEY).await?;
        Ok(count)
    }
}

/// In-process queue for tests and single-node development runs.
#[derive(Default)]
pub struct InMemoryExpiryQueue {
    tasks: Mutex<HashMap<Uuid, ExpiryTask>>,
}

impl InMemoryExpiryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpiryQueue for InMemoryExpiryQueue {
    async fn schedule(&self, task: ExpiryTask) -> BillingResult<()> {
        self.tasks.lock().await.insert(task.subscription_id, task);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> BillingResult<Vec<ExpiryTask>> {
        let mut tasks = self.tasks.lock().await;
        let mut ripe: Vec<ExpiryTask> = tasks
            .values()
            .filter(|t| t.run_at <= now)
            .cloned()
            .collect();
        ripe.sort_by_key(|t| t.run_at);
        ripe.truncate(limit);
        for task in &ripe {
            tasks.remove(&task.subscription_id);
        }
        Ok(ripe)
    }

    async fn pending_count(&self) -> BillingResult<usize> {
        Ok(self.tasks.lock().await.len())
    }
}
