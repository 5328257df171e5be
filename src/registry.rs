use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};

use crate::clock::ClockSyncService;
use crate::codec::{BeaconPayload, PayloadKind, TIMESTAMP_LEN};
use crate::config::{ProtocolConfig, ScanConfig};
use crate::messages::RawAdvertisement;

/// Returned instead of a distance when the radio reported no signal strength.
pub const UNKNOWN_DISTANCE: f64 = -1.0;

pub const DEFAULT_REFERENCE_STRENGTH: i32 = -59;
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Bare timestamps further than this from the scanner's clock are not beacons.
pub const DEFAULT_MAX_TIMESTAMP_SKEW_MS: i64 = 10 * 60 * 1000;

/// RSSI-to-distance formula. The two are not interchangeable, so a
/// deployment picks one.
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceModel {
    /// Power law below the reference strength, empirical near-field fit above.
    #[default]
    TwoRegime,
    /// `10 ^ ((reference - rssi) / (10 * n))`.
    LogDistance,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimator {
    pub model: DistanceModel,
    /// dBm measured at one meter.
    pub reference_strength: i32,
    pub path_loss_exponent: f64,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        DistanceEstimator {
            model: DistanceModel::default(),
            reference_strength: DEFAULT_REFERENCE_STRENGTH,
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
        }
    }
}

impl DistanceEstimator {
    pub fn from_config(config: &ScanConfig) -> Self {
        DistanceEstimator {
            model: config.distance_model.unwrap_or_default(),
            reference_strength: config
                .reference_strength
                .unwrap_or(DEFAULT_REFERENCE_STRENGTH),
            path_loss_exponent: config
                .path_loss_exponent
                .unwrap_or(DEFAULT_PATH_LOSS_EXPONENT),
        }
    }

    /// Meters, or [`UNKNOWN_DISTANCE`] for a zero reading.
    pub fn estimate(&self, signal_strength: i32) -> f64 {
        if signal_strength == 0 {
            return UNKNOWN_DISTANCE;
        }
        let reference = f64::from(self.reference_strength);
        let rssi = f64::from(signal_strength);
        match self.model {
            DistanceModel::TwoRegime => {
                let ratio = rssi / reference;
                if ratio < 1.0 {
                    ratio.powf(self.path_loss_exponent)
                } else {
                    0.89976 * ratio.powf(7.7095) + 0.111
                }
            }
            DistanceModel::LogDistance => {
                10f64.powf((reference - rssi) / (10.0 * self.path_loss_exponent))
            }
        }
    }
}

/// Latest view of one beacon, keyed by its radio-level identifier.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanObservation {
    #[serde(rename = "id")]
    pub device_id: String,
    pub name: Option<String>,
    /// Identity decoded from the payload, when the payload carries one.
    pub beacon_id: Option<String>,
    pub signal_strength: i32,
    pub distance_m: f64,
    pub latency_ms: Option<i64>,
    pub last_seen_ms: i64,
}

impl ScanObservation {
    pub fn distance_known(&self) -> bool {
        self.distance_m >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Not a beacon; nothing was recorded.
    Dropped,
    /// First admission of this device id in the current session.
    New,
    Repeat,
}

/// Scanner-side registry of currently visible beacons.
///
/// Owned by a single task: ingestion and snapshots never interleave, so
/// every snapshot reflects all ingests completed before it.
pub struct ScanRegistry {
    clock_sync: Arc<ClockSyncService>,
    estimator: DistanceEstimator,
    payload_kind: PayloadKind,
    tag: String,
    max_timestamp_skew_ms: i64,
    observations: HashMap<String, ScanObservation>,
}

impl ScanRegistry {
    pub fn new(
        clock_sync: Arc<ClockSyncService>,
        estimator: DistanceEstimator,
        payload_kind: PayloadKind,
        tag: &str,
    ) -> Self {
        ScanRegistry {
            clock_sync,
            estimator,
            payload_kind,
            tag: tag.to_string(),
            max_timestamp_skew_ms: DEFAULT_MAX_TIMESTAMP_SKEW_MS,
            observations: HashMap::new(),
        }
    }

    pub fn with_max_timestamp_skew(mut self, skew: Duration) -> Self {
        self.max_timestamp_skew_ms = i64::try_from(skew.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn from_config(
        clock_sync: Arc<ClockSyncService>,
        protocol: &ProtocolConfig,
        scan: &ScanConfig,
    ) -> Self {
        Self::new(
            clock_sync,
            DistanceEstimator::from_config(scan),
            protocol.payload(),
            protocol.tag(),
        )
        .with_max_timestamp_skew(scan.max_timestamp_skew())
    }

    /// Records one advertisement. Never blocks and never fails: malformed
    /// vendor data only leaves the latency unset. An event without vendor data
    /// refreshes the signal of a known device and keeps its last payload.
    pub fn ingest(&mut self, event: RawAdvertisement) -> Sighting {
        let decoded = event
            .vendor_bytes
            .as_deref()
            .map(|bytes| BeaconPayload::decode(self.payload_kind, &self.tag, bytes));
        let previous = self.observations.get(&event.device_id);
        let signal_only = event.vendor_bytes.is_none() && previous.is_some();

        if !signal_only && !self.admits(&event, decoded.as_ref().and_then(|d| d.as_ref().ok()))
        {
            return Sighting::Dropped;
        }

        let payload = match decoded {
            Some(Ok(payload)) => Some(payload),
            Some(Err(err)) => {
                debug!("Malformed payload from {}: {err}", event.device_id);
                None
            }
            None => None,
        };

        let (beacon_id, latency_ms) = match previous {
            Some(previous) if signal_only => (previous.beacon_id.clone(), previous.latency_ms),
            _ => {
                let beacon_id = payload
                    .as_ref()
                    .and_then(|p| p.identity())
                    .filter(|identity| identity.starts_with(&self.tag))
                    .map(str::to_string);
                let latency_ms = payload
                    .as_ref()
                    .and_then(|p| p.timestamp())
                    .and_then(|sent| self.clock_sync.corrected_now_ms().map(|now| now - sent));
                (beacon_id, latency_ms)
            }
        };

        let observation = ScanObservation {
            device_id: event.device_id.clone(),
            name: event.name,
            beacon_id,
            signal_strength: event.signal_strength,
            distance_m: self.estimator.estimate(event.signal_strength),
            latency_ms,
            last_seen_ms: self.clock_sync.local_now_ms(),
        };

        let sighting = if self.observations.contains_key(&event.device_id) {
            Sighting::Repeat
        } else {
            info!(
                "New beacon sighted: {} ({})",
                observation.device_id,
                observation.beacon_id.as_deref().unwrap_or("no identity")
            );
            Sighting::New
        };
        self.observations.insert(event.device_id, observation);
        sighting
    }

    /// Admission filter: only beacons may occupy registry slots.
    fn admits(&self, event: &RawAdvertisement, payload: Option<&BeaconPayload>) -> bool {
        let tagged = |text: &str| text.starts_with(&self.tag);
        if tagged(&event.device_id) || event.name.as_deref().is_some_and(tagged) {
            return true;
        }
        let Some(bytes) = event.vendor_bytes.as_deref() else {
            return false;
        };
        if self.payload_kind.carries_identity() {
            bytes.starts_with(self.tag.as_bytes())
        } else {
            // A bare timestamp carries no tag: its exact shape and a plausible
            // value are the mark.
            match payload {
                Some(BeaconPayload::Timestamp(sent)) if bytes.len() == TIMESTAMP_LEN => {
                    self.plausible_stamp(*sent)
                }
                _ => false,
            }
        }
    }

    fn plausible_stamp(&self, sent: i64) -> bool {
        let now = self
            .clock_sync
            .corrected_now_ms()
            .unwrap_or_else(|| self.clock_sync.local_now_ms());
        (now - sent).abs() <= self.max_timestamp_skew_ms
    }

    /// Current observations, in no particular order.
    pub fn snapshot(&self) -> Vec<ScanObservation> {
        self.observations.values().cloned().collect()
    }

    pub fn get(&self, device_id: &str) -> Option<&ScanObservation> {
        self.observations.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Ends the scan session; every device counts as new afterwards.
    pub fn clear(&mut self) {
        debug!("Clearing {} observations", self.observations.len());
        self.observations.clear();
    }
}
