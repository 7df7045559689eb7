//! Real-time train delay tracking.
//!
//! Polls a GTFS-Realtime trip update feed on a fixed cadence, parses the
//! entities into per-train delay records, and persists them to SQLite. A
//! circuit breaker guards the upstream feed, and a broadcast channel
//! announces updates, significant delays, and health changes to whoever
//! subscribes.

pub mod config;
pub mod events;
pub mod feed;
pub mod poller;
pub mod scheduler;
pub mod sync;
