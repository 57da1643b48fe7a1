//! Chatmeter Background Worker
//!
//! Handles scheduled jobs including:
//! - Expiry queue draining (every 5 seconds, up to 5 concurrent tasks)
//! - Monthly free-tier quota reset (1st of month, 00:00 UTC)
//! - Overdue subscription sweep (hourly, re-enqueues tasks the queue lost)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use chatmeter_billing::{
    BillingService, ExpiryQueue, ExpiryTask, LifecycleEngine, RedisExpiryQueue, SubscriptionStore,
};
use chatmeter_shared::create_pool;

/// How many due tasks one poll pulls off the queue.
const DRAIN_BATCH_SIZE: usize = 50;
/// Expiry tasks processed concurrently per poll.
const EXPIRY_CONCURRENCY: usize = 5;
/// Overdue subscriptions re-enqueued per sweep.
const SWEEP_BATCH_SIZE: i64 = 200;

/// Pull due expiry tasks and run them through the lifecycle engine.
async fn drain_expiry_queue(engine: &LifecycleEngine, queue: &Arc<RedisExpiryQueue>) {
    let now = Utc::now();
    let tasks = match queue.due(now, DRAIN_BATCH_SIZE).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!(error = %e, "Failed to poll expiry queue");
            return;
        }
    };
    if tasks.is_empty() {
        return;
    }

    info!(count = tasks.len(), "Processing due expiry tasks");
    stream::iter(tasks)
        .for_each_concurrent(EXPIRY_CONCURRENCY, |task: ExpiryTask| {
            let engine = engine.clone();
            async move {
                match engine.process_expiry(task.subscription_id, Utc::now()).await {
                    Ok(outcome) => {
                        info!(
                            subscription_id = %task.subscription_id,
                            user_id = %task.user_id,
                            outcome = ?outcome,
                            "Expiry task complete"
                        );
                    }
                    Err(e) => {
                        error!(
                            subscription_id = %task.subscription_id,
                            error = %e,
                            "Expiry task failed"
                        );
                    }
                }
            }
        })
        .await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Chatmeter Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let pool = create_pool(&database_url).await?;
    let queue = Arc::new(RedisExpiryQueue::connect(&redis_url).await?);
    let billing = Arc::new(BillingService::postgres(pool, queue.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain the expiry queue (every 5 seconds)
    // Renewals and expiries both run here; a given subscription has at most
    // one pending task, so a batch never contains duplicates.
    let drain_billing = billing.clone();
    let drain_queue = queue.clone();
    scheduler
        .add(Job::new_async("*/5 * * * * *", move |_uuid, _l| {
            let engine = drain_billing.lifecycle.clone();
            let queue = drain_queue.clone();
            Box::pin(async move {
                drain_expiry_queue(&engine, &queue).await;
            })
        })?)
        .await?;
    info!("Scheduled: Expiry queue drain (every 5 seconds)");

    // Job 2: Free-tier quota reset (1st of month at 00:00 UTC)
    let reset_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 0 1 * *", move |_uuid, _l| {
            let ledger = reset_billing.ledger.clone();
            Box::pin(async move {
                info!("Running monthly free-tier quota reset");
                match ledger.reset_all_free_tier_users().await {
                    Ok(count) => info!(count = count, "Free-tier quota reset complete"),
                    Err(e) => error!(error = %e, "Free-tier quota reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Free-tier quota reset (1st of month, 00:00 UTC)");

    // Job 3: Overdue subscription sweep (hourly)
    // At-least-once safety net: active subscriptions whose end date passed
    // without a task firing (queue wiped, missed schedule) are re-enqueued.
    let sweep_billing = billing.clone();
    let sweep_queue = queue.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let subscriptions = sweep_billing.subscription_store.clone();
            let queue = sweep_queue.clone();
            Box::pin(async move {
                let now = Utc::now();
                let overdue = match subscriptions.find_overdue(now, SWEEP_BATCH_SIZE).await {
                    Ok(subs) => subs,
                    Err(e) => {
                        error!(error = %e, "Overdue subscription sweep failed");
                        return;
                    }
                };
                if overdue.is_empty() {
                    return;
                }

                info!(count = overdue.len(), "Re-enqueueing overdue subscriptions");
                for subscription in overdue {
                    let task = ExpiryTask {
                        subscription_id: subscription.id,
                        user_id: subscription.user_id,
                        run_at: now,
                    };
                    if let Err(e) = queue.schedule(task).await {
                        error!(
                            subscription_id = %subscription.id,
                            error = %e,
                            "Failed to re-enqueue overdue subscription"
                        );
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Overdue subscription sweep (hourly)");

    // Job 4: Health check heartbeat (every 5 minutes)
    let heartbeat_queue = queue.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let queue = heartbeat_queue.clone();
            Box::pin(async move {
                match queue.pending_count().await {
                    Ok(pending) => {
                        info!(pending_tasks = pending, "Worker heartbeat - all systems operational")
                    }
                    Err(e) => error!(error = %e, "Worker heartbeat - queue unreachable"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Chatmeter Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
