use std::time::Duration;

use serde_derive::Deserialize;

use crate::codec::{DEFAULT_TAG, PayloadKind};
use crate::registry::DistanceModel;

pub const DEFAULT_TIME_ENDPOINT: &str = "https://timeapi.io/api/Time/current/zone?timeZone=UTC";

/// Service UUID the beacon advertises under.
pub const DEFAULT_SERVICE_UUID: &str = "00000000-0000-1000-8000-00805F9B34FB";

/// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
pub const DEFAULT_COMPANY_ID: u16 = 0x004C;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ClockConfig {
    pub endpoint: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl ClockConfig {
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_TIME_ENDPOINT)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(10))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ProtocolConfig {
    pub payload: Option<PayloadKind>,
    pub tag: Option<String>,
    pub company_id: Option<u16>,
    pub service_uuid: Option<String>,
}

impl ProtocolConfig {
    pub fn payload(&self) -> PayloadKind {
        self.payload.unwrap_or_default()
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    pub fn company_id(&self) -> u16 {
        self.company_id.unwrap_or(DEFAULT_COMPANY_ID)
    }

    pub fn service_uuid(&self) -> &str {
        self.service_uuid.as_deref().unwrap_or(DEFAULT_SERVICE_UUID)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct BroadcastConfig {
    pub include_device_name: Option<bool>,
    pub include_tx_power: Option<bool>,
    pub restamp_interval_ms: Option<u64>,
    pub pulse_ms: Option<u64>,
}

impl BroadcastConfig {
    pub fn restamp_interval(&self) -> Duration {
        Duration::from_millis(self.restamp_interval_ms.unwrap_or(1000).max(1))
    }

    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms.unwrap_or(100))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub distance_model: Option<DistanceModel>,
    pub reference_strength: Option<i32>,
    pub path_loss_exponent: Option<f64>,
    pub refresh_interval_ms: Option<u64>,
    pub sighting_pulse_ms: Option<u64>,
    pub max_timestamp_skew_ms: Option<u64>,
}

impl ScanConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.unwrap_or(100).max(1))
    }

    pub fn sighting_pulse(&self) -> Duration {
        Duration::from_millis(self.sighting_pulse_ms.unwrap_or(300))
    }

    pub fn max_timestamp_skew(&self) -> Duration {
        Duration::from_millis(self.max_timestamp_skew_ms.unwrap_or(10 * 60 * 1000))
    }
}
