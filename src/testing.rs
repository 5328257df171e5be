//! In-crate fakes for the external collaborators.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::broadcaster::{AdvertiseOptions, Advertiser, Notifier};
use crate::clock::{Clock, ClockSyncService, TimeSource, parse_time_response};
use crate::error::BeaconError;
use crate::manager::Presenter;
use crate::messages::RawAdvertisement;
use crate::radio::{RadioScanner, ScanFilterSpec};
use crate::registry::ScanObservation;

pub struct FixedClock {
    now_ms: AtomicI64,
}

impl FixedClock {
    pub fn new(now_ms: i64) -> Self {
        FixedClock {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub struct StaticTimeSource {
    result: Result<i64, BeaconError>,
}

impl StaticTimeSource {
    pub fn at(remote_ms: i64) -> Self {
        StaticTimeSource {
            result: Ok(remote_ms),
        }
    }

    /// Answers as if the time API had returned `body`.
    pub fn from_body(body: &str) -> Self {
        StaticTimeSource {
            result: parse_time_response(body),
        }
    }

    pub fn failing(err: BeaconError) -> Self {
        StaticTimeSource { result: Err(err) }
    }
}

#[async_trait]
impl TimeSource for StaticTimeSource {
    async fn fetch_time_ms(&self) -> Result<i64, BeaconError> {
        self.result.clone()
    }
}

/// Holds every request until `release` is notified.
pub struct GatedTimeSource {
    release: Arc<Notify>,
    remote_ms: i64,
}

impl GatedTimeSource {
    pub fn new(release: Arc<Notify>, remote_ms: i64) -> Self {
        GatedTimeSource { release, remote_ms }
    }
}

#[async_trait]
impl TimeSource for GatedTimeSource {
    async fn fetch_time_ms(&self) -> Result<i64, BeaconError> {
        self.release.notified().await;
        Ok(self.remote_ms)
    }
}

pub fn unsynced_clock_sync(now_ms: i64) -> Arc<ClockSyncService> {
    let source = StaticTimeSource::failing(BeaconError::Network("offline".to_string()));
    Arc::new(ClockSyncService::new(
        Box::new(source),
        Arc::new(FixedClock::new(now_ms)),
    ))
}

pub async fn synced_clock_sync(
    now_ms: i64,
    offset: i64,
) -> (Arc<FixedClock>, Arc<ClockSyncService>) {
    let clock = Arc::new(FixedClock::new(now_ms));
    let service = ClockSyncService::new(
        Box::new(StaticTimeSource::at(now_ms + offset)),
        clock.clone(),
    );
    assert_eq!(service.sync().await, Ok(offset));
    (clock, Arc::new(service))
}

#[derive(Default)]
pub struct RecordingAdvertiser {
    broadcasts: Mutex<Vec<(String, Vec<u8>, AdvertiseOptions)>>,
    stops: AtomicUsize,
    fail: bool,
}

impl RecordingAdvertiser {
    pub fn failing() -> Self {
        RecordingAdvertiser {
            fail: true,
            ..Default::default()
        }
    }

    pub fn broadcasts(&self) -> Vec<(String, Vec<u8>, AdvertiseOptions)> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Advertiser for RecordingAdvertiser {
    async fn broadcast(
        &self,
        service_id: &str,
        flags: &[u8],
        options: &AdvertiseOptions,
    ) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("advertising not supported");
        }
        self.broadcasts.lock().unwrap().push((
            service_id.to_string(),
            flags.to_vec(),
            options.clone(),
        ));
        Ok(())
    }

    async fn stop_broadcast(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingNotifier {
    pulses: AtomicUsize,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.pulses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn pulse(&self, _duration: Duration) -> anyhow::Result<()> {
        self.pulses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Forwards every presented snapshot to the test.
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<Vec<ScanObservation>>,
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<ScanObservation>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelPresenter { tx }, rx)
    }
}

#[async_trait]
impl Presenter for ChannelPresenter {
    async fn present(&self, observations: &[ScanObservation]) -> anyhow::Result<()> {
        self.tx.send(observations.to_vec())?;
        Ok(())
    }
}

/// Replays a fixed list of advertisements each time scanning starts.
pub struct ScriptedScanner {
    events: Vec<RawAdvertisement>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

impl ScriptedScanner {
    pub fn new(events: Vec<RawAdvertisement>) -> Self {
        ScriptedScanner {
            events,
            starts: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RadioScanner for ScriptedScanner {
    async fn start_scan(
        &mut self,
        _filter: &ScanFilterSpec,
        tx: mpsc::Sender<RawAdvertisement>,
    ) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        for event in &self.events {
            tx.send(event.clone()).await?;
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn advertisement(
    device_id: &str,
    signal_strength: i32,
    vendor_bytes: Option<&[u8]>,
) -> RawAdvertisement {
    RawAdvertisement {
        device_id: device_id.to_string(),
        name: None,
        signal_strength,
        vendor_bytes: vendor_bytes.map(<[u8]>::to_vec),
    }
}
