use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{Central as _, CentralEvent, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt as _;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ProtocolConfig;
use crate::messages::RawAdvertisement;

/// What the radio should report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilterSpec {
    /// Manufacturer-data entries under other company ids are ignored.
    pub company_id: u16,
}

impl ScanFilterSpec {
    pub fn from_config(protocol: &ProtocolConfig) -> Self {
        ScanFilterSpec {
            company_id: protocol.company_id(),
        }
    }
}

/// Radio-scan collaborator. Delivers every advertisement it hears into `tx`
/// until stopped.
#[async_trait]
pub trait RadioScanner: Send + Sync {
    async fn start_scan(
        &mut self,
        filter: &ScanFilterSpec,
        tx: mpsc::Sender<RawAdvertisement>,
    ) -> anyhow::Result<()>;

    async fn stop_scan(&mut self) -> anyhow::Result<()>;
}

pub struct BtleScanner {
    adapter: Adapter,
    task: Option<JoinHandle<()>>,
}

impl BtleScanner {
    pub fn new(adapter: Adapter) -> Self {
        BtleScanner {
            adapter,
            task: None,
        }
    }
}

#[async_trait]
impl RadioScanner for BtleScanner {
    async fn start_scan(
        &mut self,
        filter: &ScanFilterSpec,
        tx: mpsc::Sender<RawAdvertisement>,
    ) -> anyhow::Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for company id {:#06x}", filter.company_id);

        let adapter = self.adapter.clone();
        let company_id = filter.company_id;
        self.task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (id, advertised) = match event {
                    CentralEvent::ManufacturerDataAdvertisement {
                        id,
                        manufacturer_data,
                    } => (id, Some(manufacturer_data)),
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        (id, None)
                    }
                    _ => continue,
                };
                match read_advertisement(&adapter, &id, company_id, advertised.as_ref()).await {
                    Ok(Some(advertisement)) => {
                        if tx.send(advertisement).await.is_err() {
                            debug!("Advertisement receiver closed");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!("Error reading peripheral {:?}: {:?}", id, err),
                }
            }
            debug!("No more radio events");
        }));
        Ok(())
    }

    async fn stop_scan(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.adapter.stop_scan().await?;
        info!("Scan stopped");
        Ok(())
    }
}

async fn read_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    company_id: u16,
    advertised: Option<&HashMap<u16, Vec<u8>>>,
) -> Result<Option<RawAdvertisement>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(Some(to_advertisement(
        format!("{:?}", id),
        properties,
        advertised,
        company_id,
    )))
}

/// Vendor bytes come only from the manufacturer-data event that carried them.
/// The cached copy in `properties` may hold an old timestamp.
fn to_advertisement(
    device_id: String,
    properties: PeripheralProperties,
    advertised: Option<&HashMap<u16, Vec<u8>>>,
    company_id: u16,
) -> RawAdvertisement {
    RawAdvertisement {
        device_id,
        name: properties.local_name,
        signal_strength: properties.rssi.map(i32::from).unwrap_or(0),
        vendor_bytes: advertised.and_then(|data| vendor_bytes(data, company_id)),
    }
}

/// Manufacturer data filed under `company_id`, if any.
pub fn vendor_bytes(
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    company_id: u16,
) -> Option<Vec<u8>> {
    manufacturer_data.get(&company_id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_bytes_filters_company() {
        let mut data = HashMap::new();
        data.insert(0x004C, vec![1, 2, 3]);
        data.insert(0x00E0, vec![9]);

        assert_eq!(vendor_bytes(&data, 0x004C), Some(vec![1, 2, 3]));
        assert_eq!(vendor_bytes(&data, 0x018E), None);
    }

    #[test]
    fn test_cached_manufacturer_data_is_not_replayed() {
        let mut properties = PeripheralProperties {
            local_name: Some("Scooter-0001".to_string()),
            rssi: Some(-61),
            ..PeripheralProperties::default()
        };
        properties
            .manufacturer_data
            .insert(0x004C, vec![0, 0, 0, 0, 0, 1]);

        // An RSSI-only update carries no fresh payload.
        let updated = to_advertisement("dev-1".to_string(), properties.clone(), None, 0x004C);
        assert_eq!(updated.signal_strength, -61);
        assert_eq!(updated.name.as_deref(), Some("Scooter-0001"));
        assert_eq!(updated.vendor_bytes, None);

        let mut fresh = HashMap::new();
        fresh.insert(0x004C, vec![0, 0, 0, 0, 0, 2]);
        let advertised = to_advertisement("dev-1".to_string(), properties, Some(&fresh), 0x004C);
        assert_eq!(advertised.vendor_bytes, Some(vec![0, 0, 0, 0, 0, 2]));
    }
}
