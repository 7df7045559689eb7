//! Persistence of parsed delays into the `trains` table.
//!
//! Records are keyed by trip id and upserted: a train already known gets its
//! delay and actual arrival updated in place, never a second row.

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::feed::parser::ParsedTrainDelay;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to upsert trip {trip_id}: {source}")]
    UpsertError {
        trip_id: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Outcome of one batch sync.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Records written, whether newly inserted or updated in place.
    pub inserted: usize,
    pub errors: Vec<SyncError>,
}

/// Rough service classification derived from the four-digit train number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainType {
    Express,
    Intercity,
    Regional,
    Night,
}

impl TrainType {
    pub fn from_number(number: &str) -> Self {
        match number.parse::<u16>().unwrap_or(0) {
            1..=1999 => TrainType::Express,
            2000..=5999 => TrainType::Intercity,
            9000..=9999 => TrainType::Night,
            _ => TrainType::Regional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrainType::Express => "express",
            TrainType::Intercity => "intercity",
            TrainType::Regional => "regional",
            TrainType::Night => "night",
        }
    }
}

/// Upsert a batch of parsed delays.
///
/// Per-record failures are logged and collected; they never abort the rest
/// of the batch.
pub async fn sync_trains_batch(pool: &SqlitePool, delays: &[ParsedTrainDelay]) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    for delay in delays {
        match upsert_train(pool, delay).await {
            Ok(()) => outcome.inserted += 1,
            Err(source) => {
                warn!(
                    trip_id = %delay.trip_id,
                    error = %source,
                    "Failed to sync train, skipping record"
                );
                outcome.errors.push(SyncError::UpsertError {
                    trip_id: delay.trip_id.clone(),
                    source,
                });
            }
        }
    }

    info!(
        inserted = outcome.inserted,
        errors = outcome.errors.len(),
        "Completed train delay sync"
    );
    outcome
}

async fn upsert_train(pool: &SqlitePool, delay: &ParsedTrainDelay) -> Result<(), sqlx::Error> {
    let train_type = TrainType::from_number(&delay.train_number);
    let actual_arrival = delay.final_arrival.map(|t| t.to_rfc3339());
    let scheduled_arrival = delay
        .final_arrival
        .map(|t| (t - chrono::Duration::minutes(delay.final_delay_minutes as i64)).to_rfc3339());

    sqlx::query(
        r#"
        INSERT INTO trains (trip_id, train_number, date, scheduled_arrival, actual_arrival, delay_minutes, train_type, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
        ON CONFLICT(trip_id) DO UPDATE SET
            actual_arrival = excluded.actual_arrival,
            delay_minutes = excluded.delay_minutes,
            updated_at = datetime('now')
        "#,
    )
    .bind(&delay.trip_id)
    .bind(&delay.train_number)
    .bind(delay.date.to_string())
    .bind(scheduled_arrival)
    .bind(actual_arrival)
    .bind(delay.final_delay_minutes)
    .bind(train_type.as_str())
    .execute(pool)
    .await?;

    Ok(())
}
