use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::broadcast;

use scooter_beacon::config::AppConfig;
use scooter_beacon::manager::{BeaconSession, ScanSession, ScanSettings};
use scooter_beacon::messages::ControlAnnouncement;
use scooter_beacon::mqtt::MqttClient;
use scooter_beacon::radio::BtleScanner;
use scooter_beacon::{
    BeaconBroadcaster, BroadcastSettings, ClockSyncService, HttpTimeSource, ScanRegistry,
    SystemClock,
};

#[derive(Parser, Debug)]
#[command(version, about = "Scooter proximity beacon and car-side scanner")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Advertise this device as a beacon
    Beacon,
    /// Scan for nearby beacons
    Scan,
    /// Sync the clock once and print the offset
    Sync,
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    builder.init();
}

async fn connect_mqtt(
    config: &AppConfig,
) -> anyhow::Result<(Arc<MqttClient>, broadcast::Receiver<ControlAnnouncement>)> {
    let (mqtt_client, eventloop) = MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let (tx, rx) = broadcast::channel(10);
    let event_client = mqtt_client.clone();
    tokio::spawn(async move {
        event_client.event_loop(eventloop, tx).await;
    });

    Ok((Arc::new(mqtt_client), rx))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Error waiting for Ctrl-C: {:?}", err);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config_contents = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let config: AppConfig = toml::de::from_str(&config_contents)?;

    let time_source = HttpTimeSource::new(&config.clock)?;
    let clock_sync = Arc::new(ClockSyncService::new(
        Box::new(time_source),
        Arc::new(SystemClock),
    ));

    match cli.mode {
        Mode::Sync => {
            let offset = clock_sync.sync().await?;
            println!("Clock offset: {offset} ms");
        }
        Mode::Beacon => {
            let (mqtt, control) = connect_mqtt(&config).await?;
            let broadcaster = BeaconBroadcaster::new(
                clock_sync.clone(),
                mqtt.clone(),
                mqtt.clone(),
                BroadcastSettings::from_config(&config.protocol, &config.broadcast),
            );
            BeaconSession::new(clock_sync, broadcaster, config.broadcast.restamp_interval())
                .run_loop(control, shutdown_signal())
                .await?;
            mqtt.disconnect().await?;
        }
        Mode::Scan => {
            let (mqtt, control) = connect_mqtt(&config).await?;

            let bt_manager = Manager::new().await?;
            // get the first bluetooth adapter
            let adapter = bt_manager
                .adapters()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("no bluetooth adapter found"))?;

            let registry =
                ScanRegistry::from_config(clock_sync.clone(), &config.protocol, &config.scan);
            ScanSession::new(
                clock_sync,
                registry,
                Box::new(BtleScanner::new(adapter)),
                mqtt.clone(),
                mqtt.clone(),
                ScanSettings::from_config(&config),
            )
            .run_loop(control, shutdown_signal())
            .await?;
            mqtt.disconnect().await?;
        }
    }

    info!("Exiting");
    Ok(())
}
