//! btleplug-backed transport.
//!
//! Scans for the first peripheral advertising the catalog service and wraps
//! it in a [`PeripheralLink`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{BleLink, BleTransport, CharacteristicDescriptor, ServiceDescriptor};
use crate::error::{Error, Result};

/// BLE transport using the first system adapter.
pub struct BtleplugTransport {
    /// The BLE adapter to scan with.
    adapter: Adapter,
    /// How long to wait for an advertising device.
    discovery_timeout: Duration,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns `TransportUnsupported` if Bluetooth is not available.
    pub async fn new(discovery_timeout: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::TransportUnsupported {
                reason: e.to_string(),
            })?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Error::TransportUnsupported {
                reason: e.to_string(),
            })?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::TransportUnsupported {
                reason: "no Bluetooth adapter found".to_string(),
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, discovery_timeout))
    }

    /// Create a transport with a specific adapter.
    pub fn with_adapter(adapter: Adapter, discovery_timeout: Duration) -> Self {
        Self {
            adapter,
            discovery_timeout,
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan until a peripheral advertising `service` appears.
    async fn find_advertiser(&self, service: Uuid) -> Result<Option<Peripheral>> {
        // Peripherals cached by the OS from an earlier scan.
        for peripheral in self.adapter.peripherals().await? {
            if advertises(&peripheral, &service).await {
                return Ok(Some(peripheral));
            }
        }

        let mut events = self.adapter.events().await?;

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                CentralEvent::ServicesAdvertisement { id, services } => {
                    if !services.contains(&service) {
                        continue;
                    }
                    id
                }
                _ => continue,
            };

            trace!("Checking advertiser {:?}", id);

            if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                if advertises(&peripheral, &service).await {
                    return Ok(Some(peripheral));
                }
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn discover(&self, service: Uuid) -> Result<Arc<dyn BleLink>> {
        info!("Scanning for devices advertising {}", service);

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;

        let found = tokio::time::timeout(self.discovery_timeout, self.find_advertiser(service)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan cleanly: {}", e);
        }

        match found {
            Ok(Ok(Some(peripheral))) => {
                info!("Found catalog device {:?}", peripheral.id());
                Ok(Arc::new(PeripheralLink::new(self.adapter.clone(), peripheral)))
            }
            Ok(Ok(None)) => Err(Error::DiscoveryAborted {
                reason: "adapter event stream ended".to_string(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::DiscoveryAborted {
                reason: format!(
                    "no device advertising {} within {:?}",
                    service, self.discovery_timeout
                ),
            }),
        }
    }
}

/// Check the advertised services of a peripheral.
async fn advertises(peripheral: &Peripheral, service: &Uuid) -> bool {
    match peripheral.properties().await {
        Ok(Some(properties)) => properties.services.contains(service),
        _ => false,
    }
}

type AdapterEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// GATT link to a btleplug peripheral.
pub struct PeripheralLink {
    adapter: Adapter,
    peripheral: Peripheral,
    /// Adapter events subscribed before connecting, handed to `disconnections`.
    pending_events: Mutex<Option<AdapterEvents>>,
}

impl PeripheralLink {
    /// Wrap a discovered peripheral.
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
            pending_events: Mutex::new(None),
        }
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| Error::ChannelUnavailable {
                reason: format!("service {} not exposed", service),
            })?
            .characteristics
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::ChannelUnavailable {
                reason: format!("characteristic {} not exposed by {}", uuid, service),
            })
    }
}

#[async_trait]
impl BleLink for PeripheralLink {
    fn identifier(&self) -> String {
        format!("{:?}", self.peripheral.id())
    }

    async fn connect(&self) -> Result<()> {
        // Subscribe first so a drop during connect or service discovery
        // still reaches `disconnections`.
        let events = self.adapter.events().await?;
        *self.pending_events.lock() = Some(events);

        if !self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.connect().await?;
        } else {
            info!("Peripheral already connected at BLE level");
        }

        self.peripheral.discover_services().await?;
        debug!(
            "Discovered {} services on {:?}",
            self.peripheral.services().len(),
            self.peripheral.id()
        );

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    fn services(&self) -> Vec<ServiceDescriptor> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        readable: c.properties.contains(CharPropFlags::READ),
                        writable: c.properties.intersects(
                            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                        ),
                    })
                    .collect(),
            })
            .collect()
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(service, characteristic)?;
        let data = self.peripheral.read(&characteristic).await?;

        trace!(
            "Read {} bytes from characteristic {}",
            data.len(),
            characteristic.uuid
        );

        Ok(data)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(service, characteristic)?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;

        trace!(
            "Wrote {} bytes to characteristic {}",
            data.len(),
            characteristic.uuid
        );

        Ok(())
    }

    async fn disconnections(&self) -> Result<BoxStream<'static, ()>> {
        let id: PeripheralId = self.peripheral.id();
        let pending = self.pending_events.lock().take();
        let events = match pending {
            Some(events) => events,
            None => self.adapter.events().await?,
        };

        Ok(events
            .filter_map(move |event| {
                let matched = match event {
                    CentralEvent::DeviceDisconnected(dropped) => dropped == id,
                    _ => false,
                };
                if matched {
                    warn!("Peripheral {:?} reported disconnected", id);
                }
                futures::future::ready(matched.then_some(()))
            })
            .boxed())
    }
}
