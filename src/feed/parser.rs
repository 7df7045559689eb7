use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::FeedError;

/// Feed contents reduced to the fields the delay pipeline consumes.
///
/// Both the protobuf and the JSON renderings of the upstream feed normalize
/// into this shape once at ingestion; everything downstream is agnostic to
/// the wire format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelayFeed {
    /// Total entity count, including entities without trip updates.
    pub entity_count: usize,
    pub trip_updates: Vec<TripDelayUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripDelayUpdate {
    pub trip_id: String,
    pub stops: Vec<StopDelayUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopDelayUpdate {
    pub stop_id: String,
    pub arrival_delay_secs: Option<i32>,
    pub departure_delay_secs: Option<i32>,
    /// Absolute arrival estimate (unix seconds) when the feed carries one.
    pub arrival_time: Option<i64>,
}

impl From<gtfs_realtime::FeedMessage> for DelayFeed {
    fn from(feed: gtfs_realtime::FeedMessage) -> Self {
        let entity_count = feed.entity.len();
        let trip_updates = feed
            .entity
            .into_iter()
            .filter_map(|entity| entity.trip_update)
            .filter_map(|trip_update| {
                let trip_id = trip_update.trip.trip_id?;
                let stops = trip_update
                    .stop_time_update
                    .into_iter()
                    .filter_map(|stu| {
                        let stop_id = stu.stop_id?;
                        Some(StopDelayUpdate {
                            stop_id,
                            arrival_delay_secs: stu.arrival.as_ref().and_then(|a| a.delay),
                            departure_delay_secs: stu.departure.as_ref().and_then(|d| d.delay),
                            arrival_time: stu.arrival.as_ref().and_then(|a| a.time),
                        })
                    })
                    .collect();
                Some(TripDelayUpdate { trip_id, stops })
            })
            .collect();

        Self {
            entity_count,
            trip_updates,
        }
    }
}

// Wire-facing JSON types. The upstream has rendered field names in both
// camelCase and snake_case over time; aliases accept either.

#[derive(Debug, Deserialize)]
struct RawFeed {
    #[serde(default)]
    entity: Vec<RawEntity>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(default, alias = "tripUpdate")]
    trip_update: Option<RawTripUpdate>,
}

#[derive(Debug, Deserialize)]
struct RawTripUpdate {
    #[serde(default)]
    trip: RawTripDescriptor,
    #[serde(default, alias = "stopTimeUpdate")]
    stop_time_update: Vec<RawStopTimeUpdate>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTripDescriptor {
    #[serde(default, alias = "tripId")]
    trip_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStopTimeUpdate {
    #[serde(default, alias = "stopId")]
    stop_id: Option<String>,
    #[serde(default)]
    arrival: Option<RawStopTimeEvent>,
    #[serde(default)]
    departure: Option<RawStopTimeEvent>,
}

#[derive(Debug, Deserialize)]
struct RawStopTimeEvent {
    #[serde(default)]
    delay: Option<i32>,
    #[serde(default)]
    time: Option<i64>,
}

fn from_json(bytes: &[u8]) -> Result<DelayFeed, FeedError> {
    let raw: RawFeed = serde_json::from_slice(bytes)?;
    let entity_count = raw.entity.len();
    let trip_updates = raw
        .entity
        .into_iter()
        .filter_map(|entity| entity.trip_update)
        .filter_map(|trip_update| {
            let trip_id = trip_update.trip.trip_id?;
            let stops = trip_update
                .stop_time_update
                .into_iter()
                .filter_map(|stu| {
                    let stop_id = stu.stop_id?;
                    Some(StopDelayUpdate {
                        stop_id,
                        arrival_delay_secs: stu.arrival.as_ref().and_then(|a| a.delay),
                        departure_delay_secs: stu.departure.as_ref().and_then(|d| d.delay),
                        arrival_time: stu.arrival.as_ref().and_then(|a| a.time),
                    })
                })
                .collect();
            Some(TripDelayUpdate { trip_id, stops })
        })
        .collect();

    Ok(DelayFeed {
        entity_count,
        trip_updates,
    })
}

/// Decode a raw feed body, choosing the wire format by content type with a
/// JSON sniff fallback for mislabeled responses.
pub fn decode_feed(bytes: &[u8], content_type: Option<&str>) -> Result<DelayFeed, FeedError> {
    if content_type.map_or(false, |ct| ct.contains("json")) {
        return from_json(bytes);
    }

    match gtfs_realtime::FeedMessage::decode(bytes) {
        Ok(feed) => Ok(feed.into()),
        Err(e) => {
            if bytes.first() == Some(&b'{') {
                from_json(bytes)
            } else {
                Err(FeedError::from(e))
            }
        }
    }
}

/// Train number and service date split out of a composite trip id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripKey {
    pub train_number: String,
    pub date: NaiveDate,
}

/// Split a composite `NNNN-MMDD` trip id into train number and service date.
///
/// The id carries no year; it is inferred relative to `today` so the date
/// lands within six months, which keeps trips on the right side of the
/// December/January boundary. Returns `None` for anything not matching the
/// pattern or not naming a real calendar date.
pub fn parse_trip_key(trip_id: &str, today: NaiveDate) -> Option<TripKey> {
    let (number, date_part) = trip_id.split_once('-')?;
    if number.len() != 4 || date_part.len() != 4 {
        return None;
    }
    if !number.bytes().all(|b| b.is_ascii_digit())
        || !date_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let month: u32 = date_part[..2].parse().ok()?;
    let day: u32 = date_part[2..].parse().ok()?;
    let date = resolve_service_date(month, day, today)?;

    Some(TripKey {
        train_number: number.to_string(),
        date,
    })
}

/// Pick the year that puts the date within six months of `today`.
fn resolve_service_date(month: u32, day: u32, today: NaiveDate) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if date < today.checked_sub_months(Months::new(6))? {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else if date > today.checked_add_months(Months::new(6))? {
        NaiveDate::from_ymd_opt(today.year() - 1, month, day)
    } else {
        Some(date)
    }
}

/// Per-stop delay figures for one trip, in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedStopDelay {
    pub stop_id: String,
    pub arrival_delay_minutes: i32,
    pub departure_delay_minutes: i32,
}

/// Delay record for one train on one service date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedTrainDelay {
    pub trip_id: String,
    pub train_number: String,
    pub date: NaiveDate,
    pub stops: Vec<ParsedStopDelay>,
    /// Arrival delay at the last stop; what compensation rules care about.
    pub final_delay_minutes: i32,
    /// Absolute arrival estimate at the last stop, when the feed provides one.
    pub final_arrival: Option<DateTime<Utc>>,
}

/// Convert a normalized feed into per-train delay records.
///
/// Trip updates whose ids do not match the composite pattern are dropped.
pub fn extract_delays(feed: &DelayFeed, today: NaiveDate) -> Vec<ParsedTrainDelay> {
    let mut delays = Vec::with_capacity(feed.trip_updates.len());
    let mut dropped = 0usize;

    for update in &feed.trip_updates {
        let Some(key) = parse_trip_key(&update.trip_id, today) else {
            dropped += 1;
            continue;
        };

        let stops: Vec<ParsedStopDelay> = update
            .stops
            .iter()
            .map(|stop| ParsedStopDelay {
                stop_id: stop.stop_id.clone(),
                arrival_delay_minutes: delay_minutes(stop.arrival_delay_secs),
                departure_delay_minutes: delay_minutes(stop.departure_delay_secs),
            })
            .collect();

        let final_delay_minutes = stops.last().map(|s| s.arrival_delay_minutes).unwrap_or(0);
        let final_arrival = update
            .stops
            .last()
            .and_then(|s| s.arrival_time)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        delays.push(ParsedTrainDelay {
            trip_id: update.trip_id.clone(),
            train_number: key.train_number,
            date: key.date,
            stops,
            final_delay_minutes,
            final_arrival,
        });
    }

    if dropped > 0 {
        debug!(dropped, "Dropped trip updates with unrecognized trip ids");
    }

    delays
}

fn delay_minutes(delay_secs: Option<i32>) -> i32 {
    let secs = delay_secs.unwrap_or(0);
    (secs as f64 / 60.0).round() as i32
}

/// Keep only delays at or above the threshold, preserving feed order.
pub fn filter_significant_delays(
    delays: &[ParsedTrainDelay],
    threshold_minutes: i32,
) -> Vec<ParsedTrainDelay> {
    delays
        .iter()
        .filter(|d| d.final_delay_minutes >= threshold_minutes)
        .cloned()
        .collect()
}
