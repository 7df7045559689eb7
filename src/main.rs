use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delaywatch::config::Config;
use delaywatch::events::PollerEvent;
use delaywatch::feed::FeedClient;
use delaywatch::poller::DelayPoller;
use delaywatch::scheduler::{self, PollScheduler};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting delaywatch");

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    info!(
        feed_url = %config.feed.url,
        interval_secs = config.poller.interval_secs,
        "Loaded configuration"
    );

    // Initialize SQLite database
    let db_file = std::path::PathBuf::from(&config.database.path);
    if let Some(parent) = db_file.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Could not create database directory: {}", e);
        }
    }
    let db_url = format!("sqlite:{}?mode=rwc", db_file.display());
    let pool = SqlitePool::connect(&db_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    info!("Database migrations completed");

    // Wire the poller to the live feed
    let client = FeedClient::new(config.feed.clone()).expect("Failed to build feed client");
    let poller = Arc::new(DelayPoller::new(Arc::new(client), config.poller.clone()));
    spawn_delay_alerts(&poller);

    // Register the poll cadence, enqueue a warm-up poll, and run the worker
    let scheduler = PollScheduler::new(pool.clone(), config.poller.interval_secs);
    scheduler.start().await.expect("Failed to start scheduler");
    scheduler
        .trigger_now()
        .await
        .expect("Failed to enqueue warm-up poll");

    let shutting_down = Arc::new(AtomicBool::new(false));
    let worker = tokio::spawn(scheduler::run_worker(
        pool.clone(),
        Arc::clone(&poller),
        Arc::clone(&shutting_down),
    ));

    shutdown_signal().await;

    shutting_down.store(true, Ordering::SeqCst);
    if let Err(e) = scheduler.close().await {
        warn!(error = %e, "Failed to remove schedule registration");
    }
    poller.shutdown(Duration::from_secs(10)).await;
    if let Err(e) = worker.await {
        error!(error = %e, "Poll worker did not stop cleanly");
    }
    pool.close().await;
    info!("delaywatch stopped");
}

/// Surface significant-delay alerts in the logs.
///
/// Poll results, failures, circuit transitions, and health flips already
/// log inside the poller; the subscription is for the alerts themselves.
fn spawn_delay_alerts(poller: &Arc<DelayPoller>) {
    let mut rx = poller.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PollerEvent::SignificantDelay(alert)) => warn!(
                    trip_id = %alert.delay.trip_id,
                    train_number = %alert.delay.train_number,
                    delay_minutes = alert.delay.final_delay_minutes,
                    "Significantly delayed train"
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Delay alert logger lagged behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Listen for SIGTERM (container termination) or ctrl-c.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
    let ctrl_c = tokio::signal::ctrl_c();

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = ctrl_c => info!("ctrl-c received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
}
