//! Proximity beacon protocol between a scooter-mounted broadcaster and a
//! car-mounted scanner.
//!
//! The broadcaster advertises a small identity and/or timestamp payload; the
//! scanner estimates distance from signal strength, latency from the embedded
//! timestamp, and keeps a registry of visible beacons.

pub mod broadcaster;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod mqtt;
pub mod radio;
pub mod registry;

#[cfg(test)]
mod testing;

pub use broadcaster::{BeaconBroadcaster, BroadcastSettings, BroadcastState};
pub use clock::{ClockOffset, ClockSyncService, HttpTimeSource, SyncState, SystemClock};
pub use codec::{BeaconPayload, DeviceIdentity, PayloadKind};
pub use error::BeaconError;
pub use registry::{DistanceEstimator, DistanceModel, ScanObservation, ScanRegistry, Sighting};
