use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_derive::Deserialize;
use tokio::sync::watch;

use crate::config::ClockConfig;
use crate::error::BeaconError;

/// Signed correction in milliseconds: `corrected_now = local_now + offset`.
pub type ClockOffset = i64;

/// Local wall clock, in milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Authoritative network time.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn fetch_time_ms(&self) -> Result<i64, BeaconError>;
}

pub struct HttpTimeSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTimeSource {
    pub fn new(config: &ClockConfig) -> Result<Self, BeaconError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| BeaconError::Network(err.to_string()))?;
        Ok(HttpTimeSource {
            client,
            endpoint: config.endpoint().to_string(),
        })
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn fetch_time_ms(&self) -> Result<i64, BeaconError> {
        debug!("Requesting time from {}", self.endpoint);
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|err| BeaconError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BeaconError::Network(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|err| BeaconError::Network(err.to_string()))?;
        parse_time_response(&body)
    }
}

#[derive(Deserialize, Debug)]
struct TimeResponse {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
}

/// Extracts `dateTime` (UTC, no zone suffix) from a time API response body.
pub fn parse_time_response(body: &str) -> Result<i64, BeaconError> {
    let response: TimeResponse =
        serde_json::from_str(body).map_err(|err| BeaconError::Protocol(err.to_string()))?;
    let date_time = response
        .date_time
        .ok_or_else(|| BeaconError::Protocol("missing dateTime".to_string()))?;

    DateTime::parse_from_rfc3339(&format!("{date_time}Z"))
        .map(|instant| instant.timestamp_millis())
        .map_err(|err| BeaconError::Protocol(format!("bad dateTime {date_time:?}: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Unsynced { error: Option<String> },
    Syncing,
    Synced(ClockOffset),
}

/// Resets the single-flight flag even if the sync future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps the offset between the local clock and network time.
///
/// One sync may be in flight at a time; a concurrent call is rejected rather
/// than queued. Failures are never retried here.
pub struct ClockSyncService {
    source: Box<dyn TimeSource>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SyncState>,
    in_flight: AtomicBool,
}

impl ClockSyncService {
    pub fn new(source: Box<dyn TimeSource>, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(SyncState::Unsynced { error: None });
        ClockSyncService {
            source,
            clock,
            state,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn sync(&self) -> Result<ClockOffset, BeaconError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BeaconError::Precondition("sync already in progress"));
        }
        let _in_flight = InFlight(&self.in_flight);

        self.state.send_replace(SyncState::Syncing);
        match self.source.fetch_time_ms().await {
            Ok(remote_ms) => {
                let offset = remote_ms - self.clock.now_ms();
                info!("Clock synced, offset {offset} ms");
                self.state.send_replace(SyncState::Synced(offset));
                Ok(offset)
            }
            Err(err) => {
                warn!("Clock sync failed: {err}");
                self.state.send_replace(SyncState::Unsynced {
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Watches state transitions, e.g. to react to a completed sync.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        self.current_offset().is_some()
    }

    pub fn current_offset(&self) -> Option<ClockOffset> {
        match *self.state.borrow() {
            SyncState::Synced(offset) => Some(offset),
            _ => None,
        }
    }

    pub fn local_now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Network-corrected time, absent until synced.
    pub fn corrected_now_ms(&self) -> Option<i64> {
        self.current_offset()
            .map(|offset| self.clock.now_ms() + offset)
    }
}
