//! Client for the upstream GTFS-RT delay feed.
//!
//! Fetches the trip update feed over HTTP and normalizes it into a
//! [`DelayFeed`](parser::DelayFeed). Transient failures (timeouts, 5xx, rate
//! limiting) are retried with exponential backoff; everything else surfaces
//! immediately.

pub mod error;
pub mod parser;

use std::time::Duration;

use tracing::warn;

use crate::config::FeedConfig;
use error::FeedError;
use parser::DelayFeed;

/// Maximum allowed feed response size (50 MB)
const MAX_FEED_SIZE: usize = 50 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FeedClient {
    client: reqwest::Client,
    config: FeedConfig,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("delaywatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| FeedError::NetworkError(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// One GET against the feed endpoint, bounded by `timeout`.
    pub async fn fetch(&self, timeout: Duration) -> Result<DelayFeed, FeedError> {
        let timeout_ms = timeout.as_millis() as u64;

        let response = self
            .client
            .get(&self.config.url)
            .header(reqwest::header::ACCEPT, "application/x-protobuf")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::StatusError(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout_ms))?;
        if bytes.len() > MAX_FEED_SIZE {
            return Err(FeedError::ResponseTooLarge(bytes.len()));
        }

        parser::decode_feed(&bytes, content_type.as_deref())
    }

    /// Fetch with up to `max_retries` total attempts.
    ///
    /// Only retryable failures are reattempted; the wait between attempts
    /// doubles each time starting from `retry_base_delay_ms`.
    pub async fn fetch_with_retry(&self) -> Result<DelayFeed, FeedError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            match self.fetch(self.config.timeout()).await {
                Ok(feed) => return Ok(feed),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let wait = backoff_delay(self.config.retry_base_delay_ms, attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Feed fetch failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn transport_error(e: reqwest::Error, timeout_ms: u64) -> FeedError {
    if e.is_timeout() {
        FeedError::TimeoutError(timeout_ms)
    } else {
        FeedError::NetworkError(e.to_string())
    }
}

/// Exponential backoff: `base_ms * 2^attempt`.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, FeedClient) {
        let server = MockServer::start().await;
        let client = FeedClient::new(FeedConfig {
            url: format!("{}/gtfs-rt/trip-updates", server.uri()),
            timeout_secs: 5,
            max_retries: 3,
            retry_base_delay_ms: 1,
        })
        .unwrap();

        (server, client)
    }

    fn feed_body(trip_id: &str, arrival_delay_secs: i32) -> Vec<u8> {
        let message = gtfs_realtime::FeedMessage {
            header: gtfs_realtime::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: vec![gtfs_realtime::FeedEntity {
                id: "1".to_string(),
                trip_update: Some(gtfs_realtime::TripUpdate {
                    trip: gtfs_realtime::TripDescriptor {
                        trip_id: Some(trip_id.to_string()),
                        ..Default::default()
                    },
                    stop_time_update: vec![gtfs_realtime::trip_update::StopTimeUpdate {
                        stop_id: Some("stop_A".to_string()),
                        arrival: Some(gtfs_realtime::trip_update::StopTimeEvent {
                            delay: Some(arrival_delay_secs),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }],
        };
        message.encode_to_vec()
    }

    #[tokio::test]
    async fn fetch_decodes_protobuf_body() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/gtfs-rt/trip-updates"))
            .and(header("accept", "application/x-protobuf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(feed_body("9024-0615", 300)))
            .mount(&server)
            .await;

        let feed = client.fetch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(feed.entity_count, 1);
        assert_eq!(feed.trip_updates[0].trip_id, "9024-0615");
        assert_eq!(feed.trip_updates[0].stops[0].arrival_delay_secs, Some(300));
    }

    #[tokio::test]
    async fn fetch_decodes_json_body() {
        let (server, client) = setup().await;

        let body = r#"{"entity": [{"tripUpdate": {"trip": {"tripId": "9024-0615"}, "stopTimeUpdate": [{"stopId": "stop_A", "arrival": {"delay": 120}}]}}]}"#;
        Mock::given(method("GET"))
            .and(path("/gtfs-rt/trip-updates"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body, "application/json"),
            )
            .mount(&server)
            .await;

        let feed = client.fetch(Duration::from_secs(5)).await.unwrap();
        assert_eq!(feed.trip_updates[0].trip_id, "9024-0615");
        assert_eq!(feed.trip_updates[0].stops[0].arrival_delay_secs, Some(120));
    }

    #[tokio::test]
    async fn fetch_maps_http_status_to_error() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client.fetch(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, FeedError::StatusError(404)));
    }

    #[tokio::test]
    async fn fetch_times_out_on_slow_response() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(feed_body("9024-0615", 0))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client.fetch(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, FeedError::TimeoutError(50)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn fetch_with_retry_recovers_from_server_errors() {
        let (server, client) = setup().await;

        // Two failures, then a good response on the third attempt
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(feed_body("9024-0615", 60)))
            .mount(&server)
            .await;

        let feed = client.fetch_with_retry().await.unwrap();
        assert_eq!(feed.trip_updates.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fetch_with_retry_exhausts_attempts() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = client.fetch_with_retry().await.unwrap_err();
        assert!(matches!(err, FeedError::StatusError(500)));
    }

    #[tokio::test]
    async fn fetch_with_retry_fails_fast_on_client_errors() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = client.fetch_with_retry().await.unwrap_err();
        assert!(matches!(err, FeedError::StatusError(404)));
    }

    #[tokio::test]
    async fn fetch_with_retry_does_not_retry_undecodable_bodies() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client.fetch_with_retry().await.unwrap_err();
        assert!(matches!(err, FeedError::ProtobufError(_)));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1000, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(4000));
        // Saturates instead of overflowing
        assert_eq!(backoff_delay(u64::MAX, 8), Duration::from_millis(u64::MAX));
    }
}
