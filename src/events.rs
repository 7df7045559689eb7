//! Events emitted by the delay poller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::feed::parser::ParsedTrainDelay;
use crate::poller::CircuitState;

/// One event per poll outcome or state transition, fanned out to every
/// subscriber. Receivers that lag simply miss old events; each poll carries
/// the full current picture.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PollerEvent {
    Update(FeedUpdate),
    SignificantDelay(SignificantDelay),
    Error(PollFailure),
    CircuitStateChange(CircuitStateChange),
    HealthChange(HealthChange),
}

/// A poll completed and produced a fresh set of delays.
#[derive(Debug, Clone, Serialize)]
pub struct FeedUpdate {
    pub timestamp: DateTime<Utc>,
    pub entity_count: usize,
    pub delays: Vec<ParsedTrainDelay>,
}

/// One train at or above the configured delay threshold.
#[derive(Debug, Clone, Serialize)]
pub struct SignificantDelay {
    pub timestamp: DateTime<Utc>,
    pub delay: ParsedTrainDelay,
}

/// A poll attempt failed after retries.
#[derive(Debug, Clone, Serialize)]
pub struct PollFailure {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStateChange {
    pub timestamp: DateTime<Utc>,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChange {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
}

/// Sender half for poller events
pub type PollerEventSender = broadcast::Sender<PollerEvent>;
