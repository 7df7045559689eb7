//! Fault-tolerant poll loop around the feed client.
//!
//! One poller instance owns the circuit breaker state, the running metrics,
//! and the event channel. Polls never panic and never propagate errors to
//! their caller; failures turn into counters, events, and circuit
//! transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::events::{
    CircuitStateChange, FeedUpdate, HealthChange, PollFailure, PollerEvent, PollerEventSender,
    SignificantDelay,
};
use crate::feed::error::FeedError;
use crate::feed::parser::{self, DelayFeed, ParsedTrainDelay};
use crate::feed::FeedClient;

/// Circuit breaker states for the upstream feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Counters accumulated over the life of one poller instance.
///
/// Skipped polls (open circuit, shutdown) touch nothing here; only actual
/// fetch attempts count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerMetrics {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub average_latency_ms: Option<f64>,
}

/// Point-in-time health snapshot derived from the metrics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_success_age_ms: Option<u64>,
    pub metrics: PollerMetrics,
}

/// Result of a single poll cycle.
#[derive(Debug)]
pub enum PollOutcome {
    /// Circuit open or shutting down; no fetch was attempted.
    Skipped,
    Completed { delays: Vec<ParsedTrainDelay> },
    Failed,
}

/// Upstream abstraction so the poll loop can run against anything that
/// yields delay feeds.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_feed(&self) -> Result<DelayFeed, FeedError>;
}

#[async_trait]
impl FeedSource for FeedClient {
    async fn fetch_feed(&self) -> Result<DelayFeed, FeedError> {
        self.fetch_with_retry().await
    }
}

struct PollerInner {
    metrics: PollerMetrics,
    opened_at: Option<Instant>,
    total_latency_ms: u64,
    healthy: bool,
}

pub struct DelayPoller {
    source: Arc<dyn FeedSource>,
    config: PollerConfig,
    inner: RwLock<PollerInner>,
    /// Serializes poll cycles; shutdown drains the in-flight one through it.
    poll_gate: Mutex<()>,
    events_tx: PollerEventSender,
    running: AtomicBool,
    shutting_down: AtomicBool,
    /// Tells the timer task to exit; it listens only between polls.
    stop_tx: watch::Sender<()>,
}

impl DelayPoller {
    pub fn new(source: Arc<dyn FeedSource>, config: PollerConfig) -> Self {
        // Capacity 64: events are advisory, laggards just miss old ones
        let (events_tx, _) = broadcast::channel(64);
        let (stop_tx, _) = watch::channel(());

        Self {
            source,
            config,
            inner: RwLock::new(PollerInner {
                metrics: PollerMetrics::default(),
                opened_at: None,
                total_latency_ms: 0,
                healthy: true,
            }),
            poll_gate: Mutex::new(()),
            events_tx,
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Subscribe to poller events.
    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.events_tx.subscribe()
    }

    /// Run one poll cycle.
    ///
    /// Cycles are serialized: a manual call while a scheduled poll is in
    /// flight waits its turn rather than doubling up.
    pub async fn poll(&self) -> PollOutcome {
        let _in_flight = self.poll_gate.lock().await;

        if self.shutting_down.load(Ordering::SeqCst) {
            return PollOutcome::Skipped;
        }

        // Circuit gate: skip while open, probe once the reset window elapsed
        {
            let mut inner = self.inner.write().await;
            if inner.metrics.circuit_state == CircuitState::Open {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.reset_window() {
                    debug!("Circuit open, skipping poll");
                    return PollOutcome::Skipped;
                }
                self.set_circuit(&mut inner, CircuitState::HalfOpen);
                self.refresh_health(&mut inner);
            }
        }

        let started = Instant::now();
        let result = self.source.fetch_feed().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(feed) => {
                let delays = parser::extract_delays(&feed, Utc::now().date_naive());
                self.record_success(latency_ms, &feed, &delays).await;
                info!(
                    entities = feed.entity_count,
                    delays = delays.len(),
                    latency_ms,
                    "Feed poll completed"
                );
                PollOutcome::Completed { delays }
            }
            Err(e) => {
                self.record_failure(&e).await;
                PollOutcome::Failed
            }
        }
    }

    /// Start the built-in timer: one immediate poll, then one per interval.
    ///
    /// Calling this again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        // Subscribe before raising the flag: any stop() aimed at this run
        // is then guaranteed to land on this receiver
        let mut stop_rx = self.stop_tx.subscribe();
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Poller already running");
            return;
        }
        info!(
            interval_secs = self.config.interval_secs,
            "Starting delay poller"
        );

        self.poll().await;

        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.config.interval());
            // Skip the first tick which fires immediately (we already polled above)
            interval.tick().await;

            loop {
                // The stop signal lands between polls; a poll that is
                // already executing runs to completion either way.
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                // A tick and a stop can race; the stop wins
                if stop_rx.has_changed().unwrap_or(true) {
                    break;
                }
                poller.poll().await;
            }
        });
    }

    /// Halt the timer. An in-flight poll finishes and records on its own.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(());
        info!("Delay poller stopped");
    }

    /// Stop polling and wait up to `timeout` for the in-flight poll to drain.
    /// Returns regardless once the timeout expires.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down delay poller");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop();

        // The gate is free once the in-flight cycle finishes
        if tokio::time::timeout(timeout, self.poll_gate.lock())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for in-flight poll"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the running counters.
    pub async fn get_metrics(&self) -> PollerMetrics {
        self.inner.read().await.metrics.clone()
    }

    /// Health derived from the circuit state and the age of the last success.
    pub async fn get_health_status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let metrics = inner.metrics.clone();
        let healthy = compute_health(&metrics, self.config.interval());
        let last_success_age_ms = metrics.last_success_at.map(|at| {
            Utc::now()
                .signed_duration_since(at)
                .num_milliseconds()
                .max(0) as u64
        });

        HealthStatus {
            healthy,
            circuit_state: metrics.circuit_state,
            consecutive_failures: metrics.consecutive_failures,
            last_success_age_ms,
            metrics,
        }
    }

    async fn record_success(&self, latency_ms: u64, feed: &DelayFeed, delays: &[ParsedTrainDelay]) {
        let now = Utc::now();

        let mut inner = self.inner.write().await;
        inner.metrics.total_polls += 1;
        inner.metrics.successful_polls += 1;
        inner.metrics.consecutive_failures = 0;
        inner.metrics.last_poll_at = Some(now);
        inner.metrics.last_success_at = Some(now);
        inner.metrics.last_latency_ms = Some(latency_ms);
        inner.total_latency_ms += latency_ms;
        inner.metrics.average_latency_ms =
            Some(inner.total_latency_ms as f64 / inner.metrics.successful_polls as f64);

        if inner.metrics.circuit_state != CircuitState::Closed {
            self.set_circuit(&mut inner, CircuitState::Closed);
        }
        self.refresh_health(&mut inner);
        drop(inner);

        let _ = self.events_tx.send(PollerEvent::Update(FeedUpdate {
            timestamp: now,
            entity_count: feed.entity_count,
            delays: delays.to_vec(),
        }));

        for delay in
            parser::filter_significant_delays(delays, self.config.significant_delay_minutes)
        {
            let _ = self
                .events_tx
                .send(PollerEvent::SignificantDelay(SignificantDelay {
                    timestamp: now,
                    delay,
                }));
        }
    }

    async fn record_failure(&self, error: &FeedError) {
        let now = Utc::now();

        let mut inner = self.inner.write().await;
        inner.metrics.total_polls += 1;
        inner.metrics.failed_polls += 1;
        inner.metrics.consecutive_failures += 1;
        inner.metrics.last_poll_at = Some(now);
        inner.metrics.last_error_at = Some(now);
        let failures = inner.metrics.consecutive_failures;

        warn!(error = %error, consecutive_failures = failures, "Feed poll failed");
        let _ = self.events_tx.send(PollerEvent::Error(PollFailure {
            timestamp: now,
            error: error.to_string(),
            consecutive_failures: failures,
        }));

        match inner.metrics.circuit_state {
            // A failed half-open probe reopens immediately
            CircuitState::HalfOpen => self.set_circuit(&mut inner, CircuitState::Open),
            CircuitState::Closed if failures >= self.config.circuit_breaker_threshold => {
                self.set_circuit(&mut inner, CircuitState::Open)
            }
            _ => {}
        }
        self.refresh_health(&mut inner);
    }

    /// Apply a circuit transition and announce it. No-op when already there.
    fn set_circuit(&self, inner: &mut PollerInner, to: CircuitState) {
        let from = inner.metrics.circuit_state;
        if from == to {
            return;
        }
        inner.metrics.circuit_state = to;
        inner.opened_at = (to == CircuitState::Open).then(Instant::now);

        info!(from = from.as_str(), to = to.as_str(), "Circuit state changed");
        let _ = self
            .events_tx
            .send(PollerEvent::CircuitStateChange(CircuitStateChange {
                timestamp: Utc::now(),
                from,
                to,
            }));
    }

    fn refresh_health(&self, inner: &mut PollerInner) {
        let healthy = compute_health(&inner.metrics, self.config.interval());
        if healthy == inner.healthy {
            return;
        }
        inner.healthy = healthy;

        if healthy {
            info!("Poller healthy again");
        } else {
            warn!("Poller unhealthy");
        }
        let _ = self.events_tx.send(PollerEvent::HealthChange(HealthChange {
            timestamp: Utc::now(),
            healthy,
        }));
    }
}

/// Healthy while the circuit is not open and the last success, if any, is
/// younger than three poll intervals.
fn compute_health(metrics: &PollerMetrics, interval: Duration) -> bool {
    if metrics.circuit_state == CircuitState::Open {
        return false;
    }
    match metrics.last_success_at {
        Some(at) => {
            let age_ms = Utc::now()
                .signed_duration_since(at)
                .num_milliseconds()
                .max(0) as u128;
            age_ms < interval.as_millis().saturating_mul(3)
        }
        None => true,
    }
}
