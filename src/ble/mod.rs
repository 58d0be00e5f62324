//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy plumbing for reaching the
//! catalog device: discovery, connection supervision and endpoint resolution.

pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

#[cfg(test)]
pub(crate) mod mock;

pub use characteristics::{Channel, ChannelResolver, EndpointHandle};
pub use connection::{ConnectionState, Connector, ConnectorEvent, Session, SessionHandle};
pub use scanner::{BtleplugTransport, PeripheralLink};
pub use transport::{BleLink, BleTransport, CharacteristicDescriptor, ServiceDescriptor};
pub use uuids::*;
