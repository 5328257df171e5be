use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};

use crate::broadcaster::{BeaconBroadcaster, Notifier};
use crate::clock::{ClockSyncService, SyncState};
use crate::codec::PayloadKind;
use crate::config::AppConfig;
use crate::error::BeaconError;
use crate::messages::{ControlAnnouncement, RawAdvertisement};
use crate::radio::{RadioScanner, ScanFilterSpec};
use crate::registry::{ScanObservation, ScanRegistry, Sighting};

/// Capacity of the queue between the radio and the registry.
const ADVERTISEMENT_QUEUE: usize = 256;

/// Read-only consumer of registry snapshots.
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, observations: &[ScanObservation]) -> anyhow::Result<()>;
}

/// Runs one sync in the background; ingestion and broadcasting never wait on it.
fn spawn_sync(clock_sync: &Arc<ClockSyncService>) {
    let clock_sync = clock_sync.clone();
    tokio::spawn(async move {
        // Failures are already logged by the service.
        if let Err(BeaconError::Precondition(reason)) = clock_sync.sync().await {
            info!("Sync not started: {reason}");
        }
    });
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub filter: ScanFilterSpec,
    pub payload_kind: PayloadKind,
    pub refresh_interval: Duration,
    pub sighting_pulse: Duration,
}

impl ScanSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        ScanSettings {
            filter: ScanFilterSpec::from_config(&config.protocol),
            payload_kind: config.protocol.payload(),
            refresh_interval: config.scan.refresh_interval(),
            sighting_pulse: config.scan.sighting_pulse(),
        }
    }
}

/// Scanner side: radio events in, periodic snapshots out.
pub struct ScanSession {
    clock_sync: Arc<ClockSyncService>,
    registry: ScanRegistry,
    radio: Box<dyn RadioScanner>,
    notifier: Arc<dyn Notifier>,
    presenter: Arc<dyn Presenter>,
    settings: ScanSettings,
    scanning: bool,
}

impl ScanSession {
    pub fn new(
        clock_sync: Arc<ClockSyncService>,
        registry: ScanRegistry,
        radio: Box<dyn RadioScanner>,
        notifier: Arc<dyn Notifier>,
        presenter: Arc<dyn Presenter>,
        settings: ScanSettings,
    ) -> Self {
        ScanSession {
            clock_sync,
            registry,
            radio,
            notifier,
            presenter,
            settings,
            scanning: false,
        }
    }

    pub async fn run_loop(
        mut self,
        mut control: broadcast::Receiver<ControlAnnouncement>,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel(ADVERTISEMENT_QUEUE);

        // Latency needs the offset, distance does not: scan regardless.
        spawn_sync(&self.clock_sync);
        self.start_scan(&tx).await?;

        let mut ticker = time::interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = rx.recv() => self.handle_advertisement(event).await,
                _ = ticker.tick() => {
                    if self.scanning {
                        self.present().await;
                    }
                }
                msg = control.recv() => match msg {
                    Ok(ControlAnnouncement::Suspend) => self.stop_scan().await,
                    Ok(ControlAnnouncement::Resume) => {
                        if let Err(err) = self.resume(&tx).await {
                            warn!("Scan not resumed: {err}");
                        }
                    }
                    Ok(ControlAnnouncement::RetrySync) => spawn_sync(&self.clock_sync),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("Control receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Control channel closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down scanner");
                    break;
                }
            }
        }

        self.stop_scan().await;
        Ok(())
    }

    async fn handle_advertisement(&mut self, event: RawAdvertisement) {
        // Events still queued from before a suspend belong to the old session.
        if !self.scanning {
            return;
        }
        if self.registry.ingest(event) == Sighting::New {
            if let Err(err) = self.notifier.pulse(self.settings.sighting_pulse).await {
                warn!("Sighting pulse failed: {err:#}");
            }
        }
    }

    async fn present(&self) {
        let snapshot = self.registry.snapshot();
        if let Err(err) = self.presenter.present(&snapshot).await {
            error!("Error presenting observations: {err:#}");
        }
    }

    async fn start_scan(&mut self, tx: &mpsc::Sender<RawAdvertisement>) -> anyhow::Result<()> {
        if self.scanning {
            return Ok(());
        }
        self.radio.start_scan(&self.settings.filter, tx.clone()).await?;
        self.scanning = true;
        info!("Scanning started");
        Ok(())
    }

    /// Foreground again. Timestamp protocols only resume once the clock is
    /// synced.
    async fn resume(&mut self, tx: &mpsc::Sender<RawAdvertisement>) -> Result<(), BeaconError> {
        if self.settings.payload_kind.carries_timestamp() && !self.clock_sync.is_synced() {
            return Err(BeaconError::Precondition(
                "clock must be synced before scanning resumes",
            ));
        }
        self.start_scan(tx).await.map_err(BeaconError::radio)
    }

    /// Always succeeds; the registry is emptied with the session.
    async fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        if let Err(err) = self.radio.stop_scan().await {
            warn!("Error stopping scan: {err:#}");
        }
        self.scanning = false;
        self.registry.clear();
        self.present().await;
        info!("Stopped scan and cleared observations");
    }
}

/// Broadcaster side: sync, mint identity, advertise, keep the timestamp fresh.
pub struct BeaconSession {
    clock_sync: Arc<ClockSyncService>,
    broadcaster: BeaconBroadcaster,
    restamp_interval: Duration,
    suspended: bool,
}

impl BeaconSession {
    pub fn new(
        clock_sync: Arc<ClockSyncService>,
        broadcaster: BeaconBroadcaster,
        restamp_interval: Duration,
    ) -> Self {
        BeaconSession {
            clock_sync,
            broadcaster,
            restamp_interval,
            suspended: false,
        }
    }

    pub async fn run_loop(
        mut self,
        mut control: broadcast::Receiver<ControlAnnouncement>,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let mut sync_state = self.clock_sync.subscribe();
        spawn_sync(&self.clock_sync);
        if !self.broadcaster.payload_kind().carries_timestamp() {
            self.try_start().await;
        }

        let mut restamp = time::interval(self.restamp_interval);
        restamp.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                changed = sync_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = sync_state.borrow_and_update().clone();
                    if let SyncState::Synced(_) = state {
                        self.on_synced().await;
                    }
                }
                _ = restamp.tick() => {
                    if let Err(err) = self.broadcaster.refresh().await {
                        warn!("Payload restamp failed: {err}");
                    }
                }
                msg = control.recv() => match msg {
                    Ok(ControlAnnouncement::Suspend) => {
                        self.suspended = true;
                        self.broadcaster.stop().await;
                    }
                    Ok(ControlAnnouncement::Resume) => {
                        self.suspended = false;
                        self.try_start().await;
                    }
                    Ok(ControlAnnouncement::RetrySync) => spawn_sync(&self.clock_sync),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("Control receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Control channel closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down beacon");
                    break;
                }
            }
        }

        self.broadcaster.stop().await;
        Ok(())
    }

    /// Each successful sync outside a broadcast begins a new identity session.
    async fn on_synced(&mut self) {
        if !self.broadcaster.is_broadcasting() {
            if let Err(err) = self.broadcaster.renew_identity() {
                warn!("Identity not renewed: {err}");
            }
        }
        if !self.suspended {
            self.try_start().await;
        }
    }

    async fn try_start(&mut self) {
        match self.broadcaster.start().await {
            Ok(()) => {}
            Err(err @ BeaconError::Precondition(_)) => info!("Beacon not started: {err}"),
            Err(err) => error!("Beacon start failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;
    use crate::broadcaster::BroadcastSettings;
    use crate::codec::{TIMESTAMP_LEN, encode_timestamp};
    use crate::registry::DistanceEstimator;
    use crate::testing::{
        ChannelPresenter, CountingNotifier, RecordingAdvertiser, ScriptedScanner, advertisement,
        synced_clock_sync, unsynced_clock_sync,
    };

    const NOW_MS: i64 = 1_700_000_000_000;
    const WAIT: Duration = Duration::from_secs(5);

    fn scan_settings(payload_kind: PayloadKind) -> ScanSettings {
        ScanSettings {
            filter: ScanFilterSpec { company_id: 0x004C },
            payload_kind,
            refresh_interval: Duration::from_millis(10),
            sighting_pulse: Duration::from_millis(300),
        }
    }

    fn scan_session(
        clock_sync: Arc<ClockSyncService>,
        radio: ScriptedScanner,
        payload_kind: PayloadKind,
    ) -> (
        ScanSession,
        Arc<CountingNotifier>,
        mpsc::UnboundedReceiver<Vec<ScanObservation>>,
    ) {
        let registry = ScanRegistry::new(
            clock_sync.clone(),
            DistanceEstimator::default(),
            payload_kind,
            "Scooter-",
        );
        let notifier = Arc::new(CountingNotifier::default());
        let (presenter, snapshots) = ChannelPresenter::new();
        let session = ScanSession::new(
            clock_sync,
            registry,
            Box::new(radio),
            notifier.clone(),
            Arc::new(presenter),
            scan_settings(payload_kind),
        );
        (session, notifier, snapshots)
    }

    #[tokio::test]
    async fn test_scan_session_presents_deduplicated_snapshot() {
        let (_clock, clock_sync) = synced_clock_sync(NOW_MS, 0).await;
        let stamp = encode_timestamp(NOW_MS).unwrap();
        let radio = ScriptedScanner::new(vec![
            advertisement("AA", -60, Some(&stamp)),
            advertisement("BB", -70, Some(&stamp)),
            advertisement("AA", -65, Some(&stamp)),
            advertisement("CC", -40, Some(b"hello")),
        ]);
        let (session, notifier, mut snapshots) =
            scan_session(clock_sync, radio, PayloadKind::Timestamp);

        let (control_tx, control_rx) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(session.run_loop(control_rx, async move {
            let _ = shutdown_rx.await;
        }));

        let snapshot = timeout(WAIT, async {
            loop {
                let snapshot = snapshots.recv().await.unwrap();
                if snapshot.len() == 2 {
                    break snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert!(snapshot.iter().all(|o| o.device_id != "CC"));
        assert_eq!(notifier.count(), 2);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        drop(control_tx);

        // Stopping presents the cleared registry last.
        let mut last = None;
        while let Ok(snapshot) = snapshots.try_recv() {
            last = Some(snapshot);
        }
        assert_eq!(last, Some(vec![]));
    }

    #[tokio::test]
    async fn test_suspend_clears_and_resume_requires_sync() {
        let clock_sync = unsynced_clock_sync(NOW_MS);
        let radio = ScriptedScanner::new(vec![advertisement("Scooter-0001", -60, None)]);
        let starts = radio.starts.clone();
        let stops = radio.stops.clone();
        let (mut session, notifier, _snapshots) =
            scan_session(clock_sync, radio, PayloadKind::Timestamp);
        let (tx, mut rx) = mpsc::channel(8);

        session.start_scan(&tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        session.handle_advertisement(event).await;
        assert_eq!(session.registry.len(), 1);
        assert_eq!(notifier.count(), 1);

        session.stop_scan().await;
        assert!(session.registry.is_empty());
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        assert!(matches!(
            session.resume(&tx).await,
            Err(BeaconError::Precondition(_))
        ));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_starts_new_sighting_session() {
        let (_clock, clock_sync) = synced_clock_sync(NOW_MS, 0).await;
        let radio = ScriptedScanner::new(vec![advertisement("Scooter-0001", -60, None)]);
        let (mut session, notifier, _snapshots) =
            scan_session(clock_sync, radio, PayloadKind::Timestamp);
        let (tx, mut rx) = mpsc::channel(8);

        session.start_scan(&tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        session.handle_advertisement(event).await;
        session.stop_scan().await;

        session.resume(&tx).await.unwrap();
        let event = rx.recv().await.unwrap();
        session.handle_advertisement(event).await;
        assert_eq!(notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_events_after_suspend_are_ignored() {
        let clock_sync = unsynced_clock_sync(NOW_MS);
        let (mut session, notifier, _snapshots) =
            scan_session(clock_sync, ScriptedScanner::new(vec![]), PayloadKind::Identity);

        session
            .handle_advertisement(advertisement("Scooter-0001", -60, None))
            .await;
        assert!(session.registry.is_empty());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_beacon_session_broadcasts_after_sync() {
        let (_clock, clock_sync) = synced_clock_sync(NOW_MS, 0).await;
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let settings = BroadcastSettings {
            payload_kind: PayloadKind::Combined,
            ..BroadcastSettings::default()
        };
        let broadcaster = BeaconBroadcaster::new(
            clock_sync.clone(),
            advertiser.clone(),
            Arc::new(CountingNotifier::default()),
            settings,
        );
        let session = BeaconSession::new(clock_sync, broadcaster, Duration::from_secs(60));

        let (control_tx, control_rx) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(session.run_loop(control_rx, async move {
            let _ = shutdown_rx.await;
        }));

        timeout(WAIT, async {
            while advertiser.broadcasts().is_empty() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let data = advertiser.broadcasts()[0].2.manufacturer_data.clone();
        assert!(data.starts_with(b"Scooter-"));
        assert_eq!(data.len(), "Scooter-0000".len() + TIMESTAMP_LEN);

        control_tx.send(ControlAnnouncement::Suspend).unwrap();
        timeout(WAIT, async {
            while advertiser.stops() == 0 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(advertiser.stops() >= 2);
    }
}
