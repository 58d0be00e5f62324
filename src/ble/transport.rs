//! Transport seam between the connector and a BLE central implementation.
//!
//! [`BleTransport`] finds a peripheral; [`BleLink`] is the open GATT link to it.
//! The btleplug-backed implementation lives in [`crate::ble::scanner`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// A characteristic exposed by a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supports reads.
    pub readable: bool,
    /// Supports writes (with or without response).
    pub writable: bool,
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in the service.
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Finds a device to connect to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Discover a single peripheral advertising `service`.
    ///
    /// Fails with `TransportUnsupported` when no adapter can be used and with
    /// `DiscoveryAborted` when nothing suitable shows up.
    async fn discover(&self, service: Uuid) -> Result<Arc<dyn BleLink>>;
}

/// An open (or openable) GATT link to one peripheral.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Platform identifier of the peripheral.
    fn identifier(&self) -> String;

    /// Open the link and discover services.
    async fn connect(&self) -> Result<()>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is currently up.
    async fn is_connected(&self) -> bool;

    /// Services discovered on the last connect.
    fn services(&self) -> Vec<ServiceDescriptor>;

    /// Read a characteristic value.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value (with response).
    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Stream yielding once per link drop. The stream ending also means the
    /// link is gone.
    async fn disconnections(&self) -> Result<BoxStream<'static, ()>>;
}
