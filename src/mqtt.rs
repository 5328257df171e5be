use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::broadcaster::{AdvertiseOptions, Advertiser, Notifier};
use crate::manager::Presenter;
use crate::registry::ScanObservation;
use crate::{config, messages::ControlAnnouncement};

/// The MQTT side of the beacon: control topics in; advertise requests,
/// pulses and observation snapshots out.
#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct AdvertiseMessage<'a> {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flags: Option<&'a [u8]>,
    /// Hex-encoded manufacturer data.
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer_data: Option<String>,
    include_device_name: bool,
    include_tx_power: bool,
}

#[derive(Debug, Serialize)]
struct PulseMessage {
    duration_ms: u128,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"scooter-beacon".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("beacon".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(
                    format!("{}/control/suspend", self.topic_path),
                    QoS::AtMostOnce,
                ),
                SubscribeFilter::new(
                    format!("{}/control/resume", self.topic_path),
                    QoS::AtMostOnce,
                ),
                SubscribeFilter::new(format!("{}/control/sync", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        mut eventloop: rumqttc::EventLoop,
        tx: broadcast::Sender<ControlAnnouncement>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(message) = control_from_topic(&p.topic) else {
                            continue;
                        };
                        if let Err(err) = tx.send(message) {
                            error!("Error announcing control message: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn topic(&self, leaf: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            sanitize_name(&self.publisher_id),
            leaf
        )
    }

    async fn publish_json<T: serde::Serialize + Sync>(
        &self,
        leaf: &str,
        retain: bool,
        message: &T,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(message)?;
        self.client
            .publish(self.topic(leaf), QoS::AtMostOnce, retain, payload)
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[async_trait]
impl Advertiser for MqttClient {
    async fn broadcast(
        &self,
        service_id: &str,
        flags: &[u8],
        options: &AdvertiseOptions,
    ) -> anyhow::Result<()> {
        let message = AdvertiseMessage {
            active: true,
            service_id: Some(service_id),
            flags: Some(flags),
            manufacturer_data: Some(hex::encode(&options.manufacturer_data)),
            include_device_name: options.include_device_name,
            include_tx_power: options.include_tx_power,
        };
        debug!("Requesting advertisement {:?}", message);
        self.publish_json("advertise", true, &message).await
    }

    async fn stop_broadcast(&self) -> anyhow::Result<()> {
        let message = AdvertiseMessage {
            active: false,
            service_id: None,
            flags: None,
            manufacturer_data: None,
            include_device_name: false,
            include_tx_power: false,
        };
        self.publish_json("advertise", true, &message).await
    }
}

#[async_trait]
impl Notifier for MqttClient {
    async fn pulse(&self, duration: Duration) -> anyhow::Result<()> {
        let message = PulseMessage {
            duration_ms: duration.as_millis(),
        };
        self.publish_json("pulse", false, &message).await
    }
}

#[async_trait]
impl Presenter for MqttClient {
    async fn present(&self, observations: &[ScanObservation]) -> anyhow::Result<()> {
        debug!("Presenting {} observations", observations.len());
        self.publish_json("observations", false, &observations).await
    }
}

fn control_from_topic(topic: &str) -> Option<ControlAnnouncement> {
    match topic.rsplit('/').next()? {
        "suspend" => Some(ControlAnnouncement::Suspend),
        "resume" => Some(ControlAnnouncement::Resume),
        "sync" => Some(ControlAnnouncement::RetrySync),
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
