// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # catalog-sync-ble
//!
//! A Rust client for the product catalog kept on a Bluetooth Low Energy
//! point-of-sale peripheral.
//!
//! The device exposes one GATT service with a read endpoint returning the
//! whole catalog as JSON and three write endpoints taking `ADD_PRODUCT`,
//! `UPDATE_PRICE` and `DELETE_PRODUCT` commands. This crate finds the device,
//! keeps a session open, mirrors the catalog locally and applies confirmed
//! writes to the mirror without reading it back.
//!
//! ## Features
//!
//! - **Discovery**: Scan for the device by its service UUID
//! - **Reconnect**: Automatic reconnect after a fixed backoff when the link drops
//! - **Catalog Mirror**: Observable local catalog fetched on every connect
//! - **Commands**: Add products, update prices and delete products
//! - **Price Drafts**: Edit prices locally before sending them
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use catalog_sync_ble::{Controller, Price, Result, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let controller = Controller::with_btleplug(&SyncConfig::default()).await?;
//!     let mut catalog = controller.watch_catalog();
//!
//!     // The catalog is fetched once the session settles
//!     controller.connect().await?;
//!     catalog.changed().await.ok();
//!
//!     for product in &catalog.borrow().products {
//!         println!("{} {} ({})", product.name, product.price, product.barcode);
//!     }
//!
//!     controller.add_product("Widget", "9.99".parse::<Price>()?, "123").await?;
//!     controller.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod catalog_sync;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod protocol;

// Re-exports for convenience
pub use catalog_sync::{CatalogSync, Operation, SyncEvent, SyncFailure, SyncState};
pub use config::{DuplicatePolicy, SyncConfig};
pub use controller::{CallbackHandle, Controller};
pub use error::{Error, Result};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionState, ConnectorEvent, SessionHandle};
pub use ble::uuids::CATALOG_SERVICE_UUID;
pub use data::{CatalogSnapshot, Price, Product};
pub use protocol::Command;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Controller>();
        let _ = std::any::TypeId::of::<CatalogSync>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<CatalogSnapshot>();
        let _ = std::any::TypeId::of::<Product>();
        let _ = std::any::TypeId::of::<Price>();
        let _ = std::any::TypeId::of::<Command>();
    }

    #[test]
    fn test_service_uuid() {
        assert_eq!(
            CATALOG_SERVICE_UUID.to_string(),
            "12345678-1234-1234-1234-1234567890ab"
        );
    }
}
