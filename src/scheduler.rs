//! Database-backed poll scheduling.
//!
//! A single row in `schedules` holds the poll cadence. A driver task moves
//! `next_run_at` forward whenever it comes due and enqueues a row in
//! `poll_jobs`; a worker claims jobs in insertion order and runs the poller.
//! Keeping the queue in SQLite means a restart picks the cadence back up
//! instead of losing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::poller::{DelayPoller, PollOutcome};
use crate::sync;

/// Name under which the feed poll cadence is registered.
pub const POLL_SCHEDULE_NAME: &str = "feed-poll";

/// How often the driver checks for due schedules.
const DRIVER_TICK: Duration = Duration::from_secs(1);

/// How long an idle worker sleeps before checking the queue again.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

pub struct PollScheduler {
    pool: SqlitePool,
    interval_secs: u64,
    closed: Arc<AtomicBool>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(pool: SqlitePool, interval_secs: u64) -> Self {
        Self {
            pool,
            interval_secs,
            closed: Arc::new(AtomicBool::new(false)),
            driver: StdMutex::new(None),
        }
    }

    /// Register the poll schedule and spawn the driver.
    ///
    /// Registration replaces any previous row, so calling this again (or
    /// after a restart) resets the cadence instead of stacking schedules.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        sqlx::query("DELETE FROM schedules WHERE name = ?")
            .bind(POLL_SCHEDULE_NAME)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO schedules (name, interval_secs, next_run_at) \
             VALUES (?, ?, datetime('now', ?))",
        )
        .bind(POLL_SCHEDULE_NAME)
        .bind(self.interval_secs as i64)
        .bind(format!("+{} seconds", self.interval_secs))
        .execute(&self.pool)
        .await?;

        info!(
            schedule = POLL_SCHEDULE_NAME,
            interval_secs = self.interval_secs,
            "Registered poll schedule"
        );

        let pool = self.pool.clone();
        let closed = Arc::clone(&self.closed);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRIVER_TICK);
            loop {
                tick.tick().await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = enqueue_due(&pool).await {
                    error!(error = %e, "Failed to enqueue due poll jobs");
                }
            }
        });

        if let Some(old) = self
            .driver
            .lock()
            .expect("driver mutex poisoned")
            .replace(handle)
        {
            old.abort();
        }
        Ok(())
    }

    /// Enqueue a poll job out of band, without touching the cadence.
    pub async fn trigger_now(&self) -> Result<(), SchedulerError> {
        sqlx::query("INSERT INTO poll_jobs (schedule_name) VALUES (?)")
            .bind(POLL_SCHEDULE_NAME)
            .execute(&self.pool)
            .await?;
        debug!(schedule = POLL_SCHEDULE_NAME, "Enqueued immediate poll");
        Ok(())
    }

    /// Stop the driver and remove the registration. Already-enqueued jobs
    /// stay claimable.
    pub async fn close(&self) -> Result<(), SchedulerError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.driver.lock().expect("driver mutex poisoned").take() {
            handle.abort();
        }
        sqlx::query("DELETE FROM schedules WHERE name = ?")
            .bind(POLL_SCHEDULE_NAME)
            .execute(&self.pool)
            .await?;
        info!("Poll scheduler closed");
        Ok(())
    }
}

/// Advance every due schedule and enqueue one job each.
///
/// A pending job for the same schedule is replaced, not stacked: if the
/// worker fell behind, one fresh poll covers every missed tick.
async fn enqueue_due(pool: &SqlitePool) -> Result<usize, sqlx::Error> {
    let due = sqlx::query(
        r#"
        UPDATE schedules
        SET next_run_at = datetime('now', '+' || interval_secs || ' seconds')
        WHERE next_run_at <= datetime('now')
        RETURNING name
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in &due {
        let name: String = row.get("name");
        sqlx::query("DELETE FROM poll_jobs WHERE schedule_name = ?")
            .bind(&name)
            .execute(pool)
            .await?;
        sqlx::query("INSERT INTO poll_jobs (schedule_name) VALUES (?)")
            .bind(&name)
            .execute(pool)
            .await?;
        debug!(schedule = %name, "Enqueued due poll job");
    }

    Ok(due.len())
}

struct ClaimedJob {
    id: i64,
    schedule_name: String,
}

/// Claim the oldest pending job, removing it from the queue.
async fn claim_job(pool: &SqlitePool) -> Result<Option<ClaimedJob>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        DELETE FROM poll_jobs
        WHERE id = (SELECT id FROM poll_jobs ORDER BY id ASC LIMIT 1)
        RETURNING id, schedule_name
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| ClaimedJob {
        id: r.get("id"),
        schedule_name: r.get("schedule_name"),
    }))
}

/// Claim-and-poll loop. Runs until the shutdown flag is set.
///
/// Every completed poll that carried delays is synced to storage, not just
/// the significant ones.
pub async fn run_worker(pool: SqlitePool, poller: Arc<DelayPoller>, shutting_down: Arc<AtomicBool>) {
    info!("Poll worker started");

    while !shutting_down.load(Ordering::SeqCst) {
        let claimed = match claim_job(&pool).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "Failed to claim poll job");
                tokio::time::sleep(WORKER_IDLE_WAIT).await;
                continue;
            }
        };

        let Some(job) = claimed else {
            tokio::time::sleep(WORKER_IDLE_WAIT).await;
            continue;
        };

        debug!(job_id = job.id, schedule = %job.schedule_name, "Claimed poll job");
        if let PollOutcome::Completed { delays } = poller.poll().await {
            if !delays.is_empty() {
                sync::sync_trains_batch(&pool, &delays).await;
            }
        }
    }

    info!("Poll worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollerConfig;
    use crate::feed::error::FeedError;
    use crate::feed::parser::{DelayFeed, StopDelayUpdate, TripDelayUpdate};
    use crate::poller::FeedSource;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn job_count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM poll_jobs")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    struct StaticSource {
        feed: DelayFeed,
    }

    #[async_trait]
    impl FeedSource for StaticSource {
        async fn fetch_feed(&self) -> Result<DelayFeed, FeedError> {
            Ok(self.feed.clone())
        }
    }

    fn delayed_feed() -> DelayFeed {
        DelayFeed {
            entity_count: 1,
            trip_updates: vec![TripDelayUpdate {
                trip_id: "9024-0615".to_string(),
                stops: vec![StopDelayUpdate {
                    stop_id: "stop_A".to_string(),
                    arrival_delay_secs: Some(75 * 60),
                    departure_delay_secs: None,
                    arrival_time: None,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn start_replaces_previous_registration() {
        let pool = test_pool().await;
        let scheduler = PollScheduler::new(pool.clone(), 30);

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schedules")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let name: String = sqlx::query_scalar("SELECT name FROM schedules")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(name, POLL_SCHEDULE_NAME);

        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn trigger_now_enqueues_a_claimable_job() {
        let pool = test_pool().await;
        let scheduler = PollScheduler::new(pool.clone(), 30);

        scheduler.trigger_now().await.unwrap();

        let job = claim_job(&pool).await.unwrap().unwrap();
        assert_eq!(job.schedule_name, POLL_SCHEDULE_NAME);
        assert!(claim_job(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_schedule_enqueues_once_and_advances() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO schedules (name, interval_secs, next_run_at) \
             VALUES (?, 300, datetime('now', '-5 seconds'))",
        )
        .bind(POLL_SCHEDULE_NAME)
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(enqueue_due(&pool).await.unwrap(), 1);
        assert_eq!(job_count(&pool).await, 1);

        // Pushed a full interval ahead, so an immediate re-check finds nothing
        let advanced: i64 =
            sqlx::query_scalar("SELECT next_run_at > datetime('now') FROM schedules WHERE name = ?")
                .bind(POLL_SCHEDULE_NAME)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(advanced, 1);
        assert_eq!(enqueue_due(&pool).await.unwrap(), 0);
        assert_eq!(job_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn due_tick_replaces_pending_jobs_instead_of_stacking() {
        let pool = test_pool().await;
        let scheduler = PollScheduler::new(pool.clone(), 30);
        scheduler.trigger_now().await.unwrap();
        scheduler.trigger_now().await.unwrap();
        assert_eq!(job_count(&pool).await, 2);

        sqlx::query(
            "INSERT INTO schedules (name, interval_secs, next_run_at) \
             VALUES (?, 300, datetime('now', '-5 seconds'))",
        )
        .bind(POLL_SCHEDULE_NAME)
        .execute(&pool)
        .await
        .unwrap();

        enqueue_due(&pool).await.unwrap();
        assert_eq!(job_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn worker_claims_jobs_and_syncs_delays() {
        let pool = test_pool().await;
        let scheduler = PollScheduler::new(pool.clone(), 30);
        scheduler.trigger_now().await.unwrap();

        let source = Arc::new(StaticSource {
            feed: delayed_feed(),
        });
        let poller = Arc::new(DelayPoller::new(
            source,
            PollerConfig {
                interval_secs: 30,
                significant_delay_minutes: 60,
                circuit_breaker_threshold: 5,
                circuit_breaker_reset_secs: 60,
            },
        ));

        let shutting_down = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(
            pool.clone(),
            Arc::clone(&poller),
            Arc::clone(&shutting_down),
        ));

        let mut synced = 0i64;
        for _ in 0..100 {
            synced = sqlx::query_scalar("SELECT COUNT(*) FROM trains")
                .fetch_one(&pool)
                .await
                .unwrap();
            if synced > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(synced, 1);
        assert_eq!(job_count(&pool).await, 0);

        let trip_id: String = sqlx::query_scalar("SELECT trip_id FROM trains")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(trip_id, "9024-0615");
        assert_eq!(poller.get_metrics().await.total_polls, 1);

        shutting_down.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_removes_registration_and_stops_the_driver() {
        let pool = test_pool().await;
        let scheduler = PollScheduler::new(pool.clone(), 30);
        scheduler.start().await.unwrap();
        scheduler.close().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schedules")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        // Driver is gone; a due schedule inserted afterwards stays untouched
        sqlx::query(
            "INSERT INTO schedules (name, interval_secs, next_run_at) \
             VALUES (?, 30, datetime('now', '-5 seconds'))",
        )
        .bind(POLL_SCHEDULE_NAME)
        .execute(&pool)
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(job_count(&pool).await, 0);
    }
}
