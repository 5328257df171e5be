use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::clock::ClockSyncService;
use crate::codec::{BeaconPayload, DEFAULT_TAG, DeviceIdentity, PayloadKind};
use crate::config::{BroadcastConfig, DEFAULT_SERVICE_UUID, ProtocolConfig};
use crate::error::BeaconError;

/// Advertising flags handed to the radio with every broadcast.
pub const ADVERTISE_FLAGS: [u8; 2] = [1, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseOptions {
    pub manufacturer_data: Vec<u8>,
    pub include_device_name: bool,
    pub include_tx_power: bool,
}

/// Radio-advertise collaborator.
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn broadcast(
        &self,
        service_id: &str,
        flags: &[u8],
        options: &AdvertiseOptions,
    ) -> anyhow::Result<()>;

    async fn stop_broadcast(&self) -> anyhow::Result<()>;
}

/// Short haptic or notification pulse on the host.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn pulse(&self, duration: Duration) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub payload_kind: PayloadKind,
    pub tag: String,
    pub service_uuid: String,
    pub include_device_name: bool,
    pub include_tx_power: bool,
    pub pulse: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        BroadcastSettings {
            payload_kind: PayloadKind::default(),
            tag: DEFAULT_TAG.to_string(),
            service_uuid: DEFAULT_SERVICE_UUID.to_string(),
            include_device_name: false,
            include_tx_power: true,
            pulse: Duration::from_millis(100),
        }
    }
}

impl BroadcastSettings {
    pub fn from_config(protocol: &ProtocolConfig, broadcast: &BroadcastConfig) -> Self {
        BroadcastSettings {
            payload_kind: protocol.payload(),
            tag: protocol.tag().to_string(),
            service_uuid: protocol.service_uuid().to_string(),
            include_device_name: broadcast.include_device_name.unwrap_or(false),
            include_tx_power: broadcast.include_tx_power.unwrap_or(true),
            pulse: broadcast.pulse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Idle,
    Broadcasting,
}

pub struct BeaconBroadcaster {
    clock_sync: Arc<ClockSyncService>,
    advertiser: Arc<dyn Advertiser>,
    notifier: Arc<dyn Notifier>,
    settings: BroadcastSettings,
    identity: Option<DeviceIdentity>,
    state: BroadcastState,
    payload: Option<Vec<u8>>,
}

impl BeaconBroadcaster {
    pub fn new(
        clock_sync: Arc<ClockSyncService>,
        advertiser: Arc<dyn Advertiser>,
        notifier: Arc<dyn Notifier>,
        settings: BroadcastSettings,
    ) -> Self {
        BeaconBroadcaster {
            clock_sync,
            advertiser,
            notifier,
            settings,
            identity: None,
            state: BroadcastState::Idle,
            payload: None,
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.state
    }

    pub fn is_broadcasting(&self) -> bool {
        self.state == BroadcastState::Broadcasting
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.settings.payload_kind
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Bytes most recently handed to the advertiser.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Starts a new session identity. Only legal while idle.
    pub fn renew_identity(&mut self) -> Result<&DeviceIdentity, BeaconError> {
        if self.is_broadcasting() {
            return Err(BeaconError::Precondition(
                "identity is fixed while broadcasting",
            ));
        }
        let identity = DeviceIdentity::generate(&self.settings.tag);
        info!("New device identity {identity}");
        Ok(self.identity.insert(identity))
    }

    pub async fn start(&mut self) -> Result<(), BeaconError> {
        if self.is_broadcasting() {
            debug!("Already broadcasting");
            return Ok(());
        }
        if self.settings.payload_kind.carries_timestamp() && !self.clock_sync.is_synced() {
            return Err(BeaconError::Precondition(
                "clock must be synced before broadcasting",
            ));
        }

        let payload = self.build_payload()?;
        self.advertise(payload).await?;
        self.state = BroadcastState::Broadcasting;
        info!(
            "Beacon started with payload {}",
            hex::encode(self.payload.as_deref().unwrap_or_default())
        );

        if let Err(err) = self.notifier.pulse(self.settings.pulse).await {
            warn!("Session pulse failed: {err:#}");
        }
        Ok(())
    }

    /// Re-encodes the payload so that its timestamp is current. Does nothing
    /// when idle or when the payload carries no timestamp.
    pub async fn refresh(&mut self) -> Result<(), BeaconError> {
        if !self.is_broadcasting() || !self.settings.payload_kind.carries_timestamp() {
            return Ok(());
        }
        let payload = self.build_payload()?;
        self.advertise(payload).await
    }

    /// Always leaves the broadcaster idle; collaborator failures are logged.
    pub async fn stop(&mut self) {
        if let Err(err) = self.advertiser.stop_broadcast().await {
            warn!("Stopping broadcast failed: {err:#}");
        }
        if self.is_broadcasting() {
            info!("Beacon stopped");
        }
        self.state = BroadcastState::Idle;
    }

    fn build_payload(&mut self) -> Result<BeaconPayload, BeaconError> {
        let kind = self.settings.payload_kind;
        let identity = kind.carries_identity().then(|| {
            self.identity
                .get_or_insert_with(|| DeviceIdentity::generate(&self.settings.tag))
                .to_string()
        });
        let timestamp = if kind.carries_timestamp() {
            Some(self.clock_sync.corrected_now_ms().ok_or(
                BeaconError::Precondition("clock must be synced before broadcasting"),
            )?)
        } else {
            None
        };

        match (identity, timestamp) {
            (Some(identity), Some(timestamp)) => Ok(BeaconPayload::Combined {
                identity,
                timestamp,
            }),
            (Some(identity), None) => Ok(BeaconPayload::Identity(identity)),
            (None, Some(timestamp)) => Ok(BeaconPayload::Timestamp(timestamp)),
            (None, None) => Err(BeaconError::Encoding("empty payload".to_string())),
        }
    }

    async fn advertise(&mut self, payload: BeaconPayload) -> Result<(), BeaconError> {
        let options = AdvertiseOptions {
            manufacturer_data: payload.encode()?,
            include_device_name: self.settings.include_device_name,
            include_tx_power: self.settings.include_tx_power,
        };
        self.advertiser
            .broadcast(&self.settings.service_uuid, &ADVERTISE_FLAGS, &options)
            .await
            .map_err(BeaconError::radio)?;
        self.payload = Some(options.manufacturer_data);
        Ok(())
    }
}
